//! Record framing for the multi-record publish helpers.
//!
//! The data FIFO carries opaque application records; the camera and
//! point-cloud helpers prepend one of the packed metadata structs below so
//! readers can frame the stream. Every metadata struct leads with a fixed
//! 32-bit magic number that readers use to resynchronize after a dropped
//! record.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Magic number leading every camera record.
pub const CAMERA_MAGIC_NUMBER: u32 = 0x564F_584C;

/// Magic number leading every point-cloud record.
pub const POINT_CLOUD_MAGIC_NUMBER: u32 = 0x564F_584C;

/// Image formats understood by camera publishers and subscribers.
///
/// The list is not exhaustive; servers and clients may agree on custom
/// values out of band, which simply fail the `TryFrom` conversion here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum ImageFormat {
    Raw8 = 0,
    Nv12 = 1,
    StereoRaw8 = 2,
    H264 = 3,
    H265 = 4,
    Raw16 = 5,
    Nv21 = 6,
    Jpg = 7,
    Yuv422 = 8,
    Yuv420 = 9,
    Rgb = 10,
    Float32 = 11,
    StereoNv21 = 12,
    StereoRgb = 13,
    Yuv422Uyvy = 14,
    StereoNv12 = 15,
}

impl ImageFormat {
    /// True for formats carrying an encoded elementary stream, which get
    /// the header/I-frame ordering treatment on publish.
    pub fn is_encoded(self) -> bool {
        matches!(self, ImageFormat::H264 | ImageFormat::H265)
    }
}

/// Metadata sent ahead of every camera frame.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct CameraImageMeta {
    /// Set to [`CAMERA_MAGIC_NUMBER`] by the publish helpers.
    pub magic_number: u32,
    /// Start of exposure, clock-monotonic nanoseconds.
    pub timestamp_ns: i64,
    /// Frame counter from the start of the server.
    pub frame_id: i32,
    /// Image width in pixels.
    pub width: i16,
    /// Image height in pixels.
    pub height: i16,
    /// Payload size; for stereo frames the size of both halves together.
    pub size_bytes: i32,
    /// Bytes per row.
    pub stride: i32,
    /// Exposure duration in nanoseconds.
    pub exposure_ns: i32,
    /// ISO gain.
    pub gain: i16,
    /// One of the [`ImageFormat`] values.
    pub format: i16,
    /// Expected frame rate in Hz.
    pub framerate: i16,
    /// Reserved.
    pub reserved: i16,
}

/// Point-cloud layouts, each with a fixed byte cost per point.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum PointCloudFormat {
    /// Three floats: XYZ.
    FloatXyz = 0,
    /// XYZ followed by a confidence float.
    FloatXyzc = 1,
    /// XYZ followed by 8-bit RGB.
    FloatXyzRgb = 2,
    /// XYZ followed by a confidence float and 8-bit RGB.
    FloatXyzcRgb = 3,
    /// Two floats: XY.
    FloatXy = 4,
    /// XY followed by a confidence float.
    FloatXyc = 5,
}

impl PointCloudFormat {
    /// Bytes each point occupies in the payload.
    pub fn bytes_per_point(self) -> usize {
        match self {
            PointCloudFormat::FloatXyz => 12,
            PointCloudFormat::FloatXyzc => 16,
            PointCloudFormat::FloatXyzRgb => 15,
            PointCloudFormat::FloatXyzcRgb => 19,
            PointCloudFormat::FloatXy => 8,
            PointCloudFormat::FloatXyc => 12,
        }
    }
}

/// Metadata sent ahead of every point-cloud record.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct PointCloudMeta {
    /// Set to [`POINT_CLOUD_MAGIC_NUMBER`] by the publish helper.
    pub magic_number: u32,
    /// Capture time, clock-monotonic nanoseconds.
    pub timestamp_ns: i64,
    /// Number of points following the metadata.
    pub n_points: u32,
    /// One of the [`PointCloudFormat`] values.
    pub format: u32,
    /// Optional id, meaning defined by individual servers.
    pub id: u32,
    /// Optional source name, NUL-padded.
    pub server_name: [u8; 32],
    /// Reserved.
    pub reserved: u32,
}

impl PointCloudMeta {
    /// Expected payload size for this metadata, derived from the format's
    /// per-point byte cost.
    pub fn payload_size(&self) -> Result<usize> {
        let format = PointCloudFormat::try_from(self.format)
            .map_err(|_| Error::InvalidArgument("unknown point cloud format"))?;
        Ok(self.n_points as usize * format.bytes_per_point())
    }
}

#[cfg(test)]
mod test {
    use zerocopy::IntoBytes;

    use super::*;

    #[test]
    fn camera_meta_layout_is_stable() {
        assert_eq!(std::mem::size_of::<CameraImageMeta>(), 40);
        let meta = CameraImageMeta {
            magic_number: CAMERA_MAGIC_NUMBER,
            timestamp_ns: 0,
            frame_id: 7,
            width: 4,
            height: 2,
            size_bytes: 8,
            stride: 4,
            exposure_ns: 0,
            gain: 100,
            format: ImageFormat::Raw8.into(),
            framerate: 30,
            reserved: 0,
        };
        let bytes = meta.as_bytes();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..4], CAMERA_MAGIC_NUMBER.to_le_bytes().as_slice());
    }

    #[test]
    fn point_cloud_payload_sizes() {
        let mut meta = PointCloudMeta {
            magic_number: POINT_CLOUD_MAGIC_NUMBER,
            timestamp_ns: 0,
            n_points: 10,
            format: PointCloudFormat::FloatXyz.into(),
            id: 0,
            server_name: [0; 32],
            reserved: 0,
        };
        assert_eq!(meta.payload_size().unwrap(), 120);
        meta.format = PointCloudFormat::FloatXyzcRgb.into();
        assert_eq!(meta.payload_size().unwrap(), 190);
        meta.format = 99;
        assert!(meta.payload_size().is_err());
    }

    #[test]
    fn encoded_formats() {
        assert!(ImageFormat::H264.is_encoded());
        assert!(ImageFormat::H265.is_encoded());
        assert!(!ImageFormat::Raw8.is_encoded());
        assert_eq!(std::mem::size_of::<PointCloudMeta>(), 60);
    }
}
