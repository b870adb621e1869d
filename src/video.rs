//! Publish ordering for encoded camera streams.
//!
//! A decoder needs a parameter-set header and then an I-frame before any
//! P-frame is meaningful. The server keeps the most recent header sticky so
//! late subscribers receive it on attach, and it withholds P-frames from a
//! slot until that slot has seen an I-frame.
//!
//! Classification inspects the fifth payload byte and assumes the Annex-B
//! 4-byte start code prefix; length-prefixed (AVCC style) payloads would
//! misclassify and must not be published through this path.

use log::warn;
use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::records::{CAMERA_MAGIC_NUMBER, CameraImageMeta, ImageFormat};
use crate::server::Topic;

/// Frame classes that matter for delivery ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FrameKind {
    /// Codec parameter sets (SPS/PPS or VPS/SPS/PPS).
    Header,
    /// Self-contained keyframe.
    IFrame,
    /// Inter-coded frame depending on prior frames.
    PFrame,
}

/// The last observed header frame, replayed to each newly attached slot.
#[derive(Clone)]
pub(crate) struct StickyHeader {
    pub(crate) meta: CameraImageMeta,
    pub(crate) payload: Vec<u8>,
}

/// Classify an encoded frame by its NAL unit type byte, the fifth byte of
/// an Annex-B payload. Returns `None` for payloads too short to inspect or
/// NAL types outside the header/I/P set.
pub(crate) fn classify(format: ImageFormat, payload: &[u8]) -> Option<FrameKind> {
    let nal = *payload.get(4)?;
    match format {
        ImageFormat::H264 => match nal {
            0x67 => Some(FrameKind::Header),
            0x65 => Some(FrameKind::IFrame),
            0x41 => Some(FrameKind::PFrame),
            _ => None,
        },
        ImageFormat::H265 => match nal {
            0x40 => Some(FrameKind::Header),
            0x26 => Some(FrameKind::IFrame),
            0x02 => Some(FrameKind::PFrame),
            _ => None,
        },
        _ => None,
    }
}

/// Publish one camera frame, routing encoded streams through the
/// header/I-frame gate and everything else straight to a broadcast.
pub(crate) fn publish_camera_frame(
    topic: &Topic,
    mut meta: CameraImageMeta,
    payload: &[u8],
) -> Result<()> {
    let size = meta.size_bytes;
    if size <= 0 {
        return Err(Error::InvalidArgument("frame size must be positive"));
    }
    if size as usize != payload.len() {
        return Err(Error::InvalidArgument("metadata size does not match payload"));
    }
    meta.magic_number = CAMERA_MAGIC_NUMBER;

    let format = match ImageFormat::try_from(meta.format) {
        Ok(format) if format.is_encoded() => format,
        _ => {
            // raw and unrecognized formats broadcast unconditionally
            topic.broadcast(&[meta.as_bytes(), payload]);
            return Ok(());
        }
    };

    match classify(format, payload) {
        Some(FrameKind::Header) => {
            // held for attach replay, not broadcast
            *topic.sticky_header.lock() = Some(StickyHeader {
                meta,
                payload: payload.to_vec(),
            });
        }
        Some(FrameKind::IFrame) => {
            for client in 0..topic.slot_count() {
                if topic.write_record_to(client, &[meta.as_bytes(), payload]).is_ok() {
                    topic.set_accepting_p_frames(client, true);
                }
            }
        }
        Some(FrameKind::PFrame) => {
            for client in 0..topic.slot_count() {
                if topic.accepting_p_frames(client) {
                    let _ = topic.write_record_to(client, &[meta.as_bytes(), payload]);
                }
            }
        }
        None => {
            warn!(
                "channel {} dropped {format:?} frame of unknown NAL type {:#04x}",
                topic.index,
                payload.get(4).copied().unwrap_or(0)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn annexb(nal: u8) -> [u8; 8] {
        [0, 0, 0, 1, nal, 0xaa, 0xbb, 0xcc]
    }

    #[test]
    fn h264_nal_table() {
        assert_eq!(classify(ImageFormat::H264, &annexb(0x67)), Some(FrameKind::Header));
        assert_eq!(classify(ImageFormat::H264, &annexb(0x65)), Some(FrameKind::IFrame));
        assert_eq!(classify(ImageFormat::H264, &annexb(0x41)), Some(FrameKind::PFrame));
        assert_eq!(classify(ImageFormat::H264, &annexb(0x06)), None);
    }

    #[test]
    fn h265_nal_table() {
        assert_eq!(classify(ImageFormat::H265, &annexb(0x40)), Some(FrameKind::Header));
        assert_eq!(classify(ImageFormat::H265, &annexb(0x26)), Some(FrameKind::IFrame));
        assert_eq!(classify(ImageFormat::H265, &annexb(0x02)), Some(FrameKind::PFrame));
        assert_eq!(classify(ImageFormat::H265, &annexb(0x13)), None);
    }

    #[test]
    fn short_or_raw_payloads_do_not_classify() {
        assert_eq!(classify(ImageFormat::H264, &[0, 0, 0]), None);
        assert_eq!(classify(ImageFormat::Raw8, &annexb(0x67)), None);
    }
}
