//! Camera, stereo, and point-cloud publishing against live subscribers,
//! including the header/I-frame ordering for encoded streams.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use pipebus::{
    CAMERA_MAGIC_NUMBER, CameraImageMeta, Error, ImageFormat, POINT_CLOUD_MAGIC_NUMBER,
    PipeServer, PointCloudFormat, PointCloudMeta, ServerFlags, TopicInfo,
};
use tempfile::TempDir;
use zerocopy::FromBytes;

const META_LEN: usize = std::mem::size_of::<CameraImageMeta>();

fn topic_info(root: &Path, name: &str) -> TopicInfo {
    let mut info = TopicInfo::new(name);
    info.location = format!("{}/{name}/", root.display());
    info.type_tag = "camera_image_metadata".to_string();
    info.server_name = "pipebus-tests".to_string();
    info
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn join(dir: &Path, base: &str, expected_name: &str) -> File {
    let mut request = OpenOptions::new()
        .write(true)
        .open(dir.join("request"))
        .unwrap();
    request.write_all(format!("{base}\0").as_bytes()).unwrap();
    drop(request);
    let data_path = dir.join(expected_name);
    assert!(wait_for(|| data_path.exists(), Duration::from_secs(2)));
    OpenOptions::new().read(true).open(&data_path).unwrap()
}

fn camera_meta(format: ImageFormat, size_bytes: usize) -> CameraImageMeta {
    CameraImageMeta {
        magic_number: 0, // the publish helpers fill this in
        timestamp_ns: 1_000,
        frame_id: 1,
        width: 2,
        height: 2,
        size_bytes: size_bytes as i32,
        stride: 2,
        exposure_ns: 0,
        gain: 100,
        format: format.into(),
        framerate: 30,
        reserved: 0,
    }
}

/// An 8-byte Annex-B payload with the given NAL unit type byte.
fn annexb_frame(nal: u8) -> Vec<u8> {
    vec![0, 0, 0, 1, nal, 0xde, 0xad, 0x00]
}

/// Read one metadata-plus-payload camera record and return the payload.
fn read_camera_record(reader: &mut File) -> (CameraImageMeta, Vec<u8>) {
    let mut meta_buf = [0u8; META_LEN];
    reader.read_exact(&mut meta_buf).unwrap();
    let meta = CameraImageMeta::read_from_bytes(&meta_buf).unwrap();
    assert_eq!({ meta.magic_number }, CAMERA_MAGIC_NUMBER);
    let mut payload = vec![0u8; meta.size_bytes as usize];
    reader.read_exact(&mut payload).unwrap();
    (meta, payload)
}

fn nal_of(payload: &[u8]) -> u8 {
    payload[4]
}

#[test]
fn late_joiner_sees_header_then_i_before_any_p() {
    let tmp = TempDir::new().unwrap();
    let dir: PathBuf = tmp.path().join("h264");
    let server = PipeServer::new();
    server
        .create(0, topic_info(tmp.path(), "h264"), ServerFlags::empty())
        .unwrap();

    let header = annexb_frame(0x67);
    let iframe = annexb_frame(0x65);
    let pframe = annexb_frame(0x41);
    let meta = camera_meta(ImageFormat::H264, header.len());

    // the header is held sticky, not broadcast
    server.write_camera_frame(0, meta, &header).unwrap();

    let mut early = join(&dir, "early", "early0");
    assert!(wait_for(
        || server.num_clients(0).unwrap() == 1,
        Duration::from_secs(2)
    ));

    server.write_camera_frame(0, meta, &iframe).unwrap();
    server.write_camera_frame(0, meta, &pframe).unwrap();
    server.write_camera_frame(0, meta, &pframe).unwrap();

    let mut late = join(&dir, "late", "late0");
    assert!(wait_for(
        || server.num_clients(0).unwrap() == 2,
        Duration::from_secs(2)
    ));

    // the late joiner is not accepting P-frames yet
    server.write_camera_frame(0, meta, &pframe).unwrap();
    server.write_camera_frame(0, meta, &iframe).unwrap();
    server.write_camera_frame(0, meta, &pframe).unwrap();

    let early_nals: Vec<u8> = (0..7)
        .map(|_| nal_of(&read_camera_record(&mut early).1))
        .collect();
    assert_eq!(early_nals, [0x67, 0x65, 0x41, 0x41, 0x41, 0x65, 0x41]);

    let late_nals: Vec<u8> = (0..3)
        .map(|_| nal_of(&read_camera_record(&mut late).1))
        .collect();
    assert_eq!(late_nals, [0x67, 0x65, 0x41]);

    // neither stream may show a P-frame before its first I-frame
    for nals in [&early_nals, &late_nals] {
        let first_p = nals.iter().position(|&n| n == 0x41);
        let first_i = nals.iter().position(|&n| n == 0x65);
        assert!(first_i.unwrap() < first_p.unwrap());
    }
}

#[test]
fn unknown_nal_frames_are_dropped() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("h265");
    let server = PipeServer::new();
    server
        .create(0, topic_info(tmp.path(), "h265"), ServerFlags::empty())
        .unwrap();

    let mut reader = join(&dir, "sub", "sub0");
    assert!(wait_for(
        || server.num_clients(0).unwrap() == 1,
        Duration::from_secs(2)
    ));

    let meta = camera_meta(ImageFormat::H265, 8);
    // SEI-ish garbage: consumed without delivery
    server.write_camera_frame(0, meta, &annexb_frame(0x13)).unwrap();
    // I-frame arrives afterwards and is delivered
    server.write_camera_frame(0, meta, &annexb_frame(0x26)).unwrap();

    let (_, payload) = read_camera_record(&mut reader);
    assert_eq!(nal_of(&payload), 0x26);
    assert_eq!(server.bytes_in_pipe(0, 0).unwrap(), 0);
}

#[test]
fn raw_frames_broadcast_with_forced_magic() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("raw");
    let server = PipeServer::new();
    server
        .create(0, topic_info(tmp.path(), "raw"), ServerFlags::empty())
        .unwrap();

    let mut reader = join(&dir, "sub", "sub0");
    assert!(wait_for(
        || server.num_clients(0).unwrap() == 1,
        Duration::from_secs(2)
    ));

    let pixels = [9u8; 4];
    let meta = camera_meta(ImageFormat::Raw8, pixels.len());
    server.write_camera_frame(0, meta, &pixels).unwrap();

    let (meta_out, payload) = read_camera_record(&mut reader);
    assert_eq!({ meta_out.frame_id }, 1);
    assert_eq!(payload, pixels);

    // size mismatch is a caller error, nothing is delivered
    assert!(matches!(
        server.write_camera_frame(0, meta, &[1, 2]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn stereo_frames_carry_both_halves_in_order() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("stereo");
    let server = PipeServer::new();
    server
        .create(0, topic_info(tmp.path(), "stereo"), ServerFlags::empty())
        .unwrap();

    let mut reader = join(&dir, "sub", "sub0");
    assert!(wait_for(
        || server.num_clients(0).unwrap() == 1,
        Duration::from_secs(2)
    ));

    let left = [0x11u8; 4];
    let right = [0x22u8; 4];
    let meta = camera_meta(ImageFormat::StereoRaw8, left.len() + right.len());
    server.write_stereo_frame(0, meta, &left, &right).unwrap();

    let (_, payload) = read_camera_record(&mut reader);
    assert_eq!(&payload[..4], &left);
    assert_eq!(&payload[4..], &right);

    // odd total size is rejected
    let mut bad = meta;
    bad.size_bytes = 7;
    assert!(matches!(
        server.write_stereo_frame(0, bad, &left, &right),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn point_cloud_size_is_derived_from_format() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("cloud");
    let server = PipeServer::new();
    server
        .create(0, topic_info(tmp.path(), "cloud"), ServerFlags::empty())
        .unwrap();

    let mut reader = join(&dir, "sub", "sub0");
    assert!(wait_for(
        || server.num_clients(0).unwrap() == 1,
        Duration::from_secs(2)
    ));

    let meta = PointCloudMeta {
        magic_number: 0,
        timestamp_ns: 5,
        n_points: 3,
        format: PointCloudFormat::FloatXyz.into(),
        id: 0,
        server_name: [0; 32],
        reserved: 0,
    };
    let payload = [0u8; 36];
    server.write_point_cloud(0, meta, &payload).unwrap();

    let mut meta_buf = [0u8; std::mem::size_of::<PointCloudMeta>()];
    reader.read_exact(&mut meta_buf).unwrap();
    let meta_out = PointCloudMeta::read_from_bytes(&meta_buf).unwrap();
    assert_eq!({ meta_out.magic_number }, POINT_CLOUD_MAGIC_NUMBER);
    assert_eq!({ meta_out.n_points }, 3);
    let mut cloud = vec![0u8; 36];
    reader.read_exact(&mut cloud).unwrap();

    // wrong payload size for the declared point count is rejected
    assert!(matches!(
        server.write_point_cloud(0, meta, &payload[..24]),
        Err(Error::InvalidArgument(_))
    ));
}
