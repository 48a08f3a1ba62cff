extern crate vla_codec_rs;

use std::collections::BTreeMap;
use std::fs;

use ffmpeg_next as ffmpeg;
use ndarray::{Array1, Array2, Array3, Axis};
use rand::Rng;
use tempfile::TempDir;

use vla_codec_rs::codec::Encoding;
use vla_codec_rs::{
    Columns, ColumnMap, Sample, SampleMap, Trajectory, TrajectoryError, TrajectoryOptions,
};

fn scratch_options(dir: &TempDir, lossy_compression: bool) -> TrajectoryOptions {
    TrajectoryOptions {
        cache_dir: dir.path().join("cache"),
        lossy_compression,
        ..TrajectoryOptions::default()
    }
}

#[test]
fn test_write_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    for step in 0..10i64 {
        trajectory
            .add("arm_view", Array3::<u8>::ones((640, 480, 3)), Some(step))
            .unwrap();
        trajectory
            .add("gripper_pose", Array2::<f32>::ones((4, 4)), Some(step))
            .unwrap();
        trajectory
            .add("joint_angles", Array1::<f32>::ones(7), Some(step))
            .unwrap();
    }
    trajectory.close(true).unwrap();

    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    let data = reopened.load().unwrap();

    let arm_view = data["arm_view"].as_uint8().unwrap();
    assert_eq!(arm_view.shape(), &[10, 640, 480, 3]);
    assert!(arm_view.iter().all(|&v| v == 1));

    let joint_angles = data["joint_angles"].as_float32().unwrap();
    assert_eq!(joint_angles.shape(), &[10, 7]);
    assert!(joint_angles.iter().all(|&v| v == 1.0));

    let gripper_pose = data["gripper_pose"].as_float32().unwrap();
    assert_eq!(gripper_pose.shape(), &[10, 4, 4]);
    assert!(gripper_pose.iter().all(|&v| v == 1.0));
}

#[test]
fn test_feature_added_mid_trajectory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    for step in 0..3i64 {
        trajectory.add("a", 1.0f64, Some(step)).unwrap();
    }
    trajectory.add("a", 1.0f64, Some(3)).unwrap();
    trajectory.add("b", 2.0f64, Some(3)).unwrap();
    trajectory.close(true).unwrap();

    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    let data = reopened.load().unwrap();
    assert_eq!(data.len(), 2);

    let a = data["a"].as_float64().unwrap();
    assert_eq!(a.shape(), &[4]);
    assert!(a.iter().all(|&v| v == 1.0));

    let b = data["b"].as_float64().unwrap();
    assert_eq!(b.shape(), &[1]);
    assert_eq!(b[[0]], 2.0);
}

#[test]
fn test_from_dict_of_lists_rejects_ragged_columns() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");

    let mut columns = ColumnMap::new();
    columns.insert("x".to_string(), Columns::from(vec![1.0f64, 2.0, 3.0]));
    columns.insert("y".to_string(), Columns::from(vec![4.0f64, 5.0]));

    let err = Trajectory::from_dict_of_lists(&columns, &path, "/", false).unwrap_err();
    assert!(matches!(err, TrajectoryError::ShapeMismatch(_)));
}

#[test]
fn test_from_dict_of_lists_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");

    let mut pose = ColumnMap::new();
    pose.insert("pos".to_string(), Columns::from(vec![1.0f64, 2.0, 3.0]));
    pose.insert("rot".to_string(), Columns::from(vec![0.5f64, 0.25, 0.125]));
    let mut columns = ColumnMap::new();
    columns.insert("pose".to_string(), Columns::Map(pose));
    columns.insert(
        "task".to_string(),
        Columns::from(vec!["reach", "grasp", "lift"]),
    );

    Trajectory::from_dict_of_lists(&columns, &path, "/", false).unwrap();

    let dir_options = scratch_options(&dir, false);
    let mut reopened = Trajectory::open_read(&path, dir_options).unwrap();
    let data = reopened.load().unwrap();

    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["pose/pos", "pose/rot", "task"]);

    let pos = data["pose/pos"].as_float64().unwrap();
    assert_eq!(pos.shape(), &[3]);
    assert_eq!(pos[[0]], 1.0);
    assert_eq!(pos[[2]], 3.0);

    let task = data["task"].as_str().unwrap();
    assert_eq!(task[[1]], "grasp");
}

#[test]
fn test_add_by_dict_flattens_nested_maps() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut pose = SampleMap::new();
    pose.insert(
        "pos".to_string(),
        Sample::from(Array1::<f64>::from(vec![1.0, 2.0, 3.0])),
    );
    pose.insert("rot".to_string(), Sample::from(Array2::<f64>::eye(2)));
    let mut step = SampleMap::new();
    step.insert("pose".to_string(), Sample::Map(pose));

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    trajectory.add_by_dict(&step, None).unwrap();
    trajectory.close(true).unwrap();

    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    let data = reopened.load().unwrap();
    assert!(data.contains_key("pose/pos"));
    assert!(data.contains_key("pose/rot"));
    assert_eq!(data["pose/pos"].shape(), &[1, 3]);
    assert_eq!(data["pose/rot"].shape(), &[1, 2, 2]);
}

#[test]
fn test_add_rejects_map_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options).unwrap();
    let nested = Sample::Map(SampleMap::new());
    assert!(matches!(
        trajectory.add("oops", nested, None),
        Err(TrajectoryError::InvalidValue)
    ));
}

#[test]
fn test_double_close_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options).unwrap();
    trajectory.add("a", 1.0f64, None).unwrap();
    trajectory.close(true).unwrap();
    assert!(matches!(
        trajectory.close(true),
        Err(TrajectoryError::DoubleClose)
    ));
}

#[test]
fn test_ffv1_images_round_trip_exactly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let mut rng = rand::thread_rng();

    let images: Vec<Array3<u8>> = (0..5)
        .map(|_| Array3::from_shape_fn((100, 100, 3), |_| rng.gen()))
        .collect();
    let steps: Vec<SampleMap> = images
        .iter()
        .map(|image| {
            let mut step = SampleMap::new();
            step.insert("img".to_string(), Sample::from(image.clone()));
            step
        })
        .collect();

    Trajectory::from_list_of_dicts(&steps, &path, false).unwrap();

    let options = scratch_options(&dir, false);
    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    let data = reopened.load().unwrap();
    let decoded = data["img"].as_uint8().unwrap();
    assert_eq!(decoded.shape(), &[5, 100, 100, 3]);
    for (i, image) in images.iter().enumerate() {
        assert_eq!(
            decoded.index_axis(Axis(0), i),
            image.view().into_dyn(),
            "frame {i} must survive lossless compaction byte for byte"
        );
    }
}

#[test]
fn test_av1_images_keep_structure() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, true);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    for step in 0..4i64 {
        trajectory
            .add("img", Array3::<u8>::from_elem((128, 128, 3), 128), Some(step))
            .unwrap();
    }
    trajectory.close(true).unwrap();

    ffmpeg::init().unwrap();
    let container = ffmpeg::format::input(&path).unwrap();
    let stream = container.streams().next().unwrap();
    assert_eq!(stream.parameters().id(), ffmpeg::codec::Id::AV1);
    drop(container);

    // lossy compaction preserves layout, not bytes
    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    let data = reopened.load().unwrap();
    let decoded = data["img"].as_uint8().unwrap();
    assert_eq!(decoded.shape(), &[4, 128, 128, 3]);
}

#[test]
fn test_float_depth_maps_decode_as_gray_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    for step in 0..5i64 {
        trajectory
            .add("depth", Array2::<f32>::ones((480, 640)), Some(step))
            .unwrap();
    }
    trajectory.close(true).unwrap();

    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    let data = reopened.load().unwrap();
    let depth = data["depth"].as_float32().unwrap();
    assert_eq!(depth.shape(), &[5, 480, 640]);
    // the writer scales 1.0 -> 255; the reader does not invert the scale
    assert!(depth.iter().all(|&v| v == 255.0));
}

#[test]
fn test_second_load_is_served_by_the_cache() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    for i in 0..4i64 {
        trajectory.add("step", i as f64, Some(i)).unwrap();
    }
    trajectory.close(true).unwrap();

    let mut reader = Trajectory::open_read(&path, options).unwrap();
    let first = reader.load().unwrap();
    assert!(reader.cache_path().exists());

    // deleting the container proves the second load never reopens it
    fs::remove_file(&path).unwrap();
    let second = reader.load().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_container_invariants() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options).unwrap();
    for step in 0..3i64 {
        trajectory
            .add("img", Array3::<u8>::zeros((120, 100, 3)), Some(step))
            .unwrap();
        trajectory.add("reward", 0.5f64, Some(step)).unwrap();
    }
    trajectory.close(true).unwrap();

    ffmpeg::init().unwrap();
    let mut container = ffmpeg::format::input(&path).unwrap();
    assert_eq!(container.nb_streams(), 2);

    let mut img_stream_index = None;
    for stream in container.streams() {
        let name = stream.metadata().get("FEATURE_NAME").unwrap().to_string();
        let feature_type = stream.metadata().get("FEATURE_TYPE").unwrap().to_string();
        assert_eq!(stream.time_base(), ffmpeg::Rational::new(1, 1000));
        match name.as_str() {
            "img" => {
                assert_eq!(stream.parameters().id(), ffmpeg::codec::Id::FFV1);
                assert_eq!(feature_type, "uint8(120,100,3)");
                let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .unwrap()
                    .decoder()
                    .video()
                    .unwrap();
                assert_eq!(decoder.width(), 100);
                assert_eq!(decoder.height(), 120);
                img_stream_index = Some(stream.index());
            }
            "reward" => {
                assert_eq!(stream.parameters().id(), ffmpeg::codec::Id::RAWVIDEO);
                assert_eq!(feature_type, "float64()");
            }
            other => panic!("unexpected stream {other}"),
        }
    }
    assert!(img_stream_index.is_some());

    // per-stream pts must be non-decreasing
    let mut last_pts: BTreeMap<usize, i64> = BTreeMap::new();
    for (stream, packet) in container.packets() {
        if let Some(pts) = packet.pts() {
            if let Some(previous) = last_pts.insert(stream.index(), pts) {
                assert!(pts >= previous, "stream {} pts went backwards", stream.index());
            }
        }
    }
}

#[test]
fn test_get_and_to_hdf5() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    for step in 0..2i64 {
        trajectory
            .add("joint_angles", Array1::<f32>::ones(7), Some(step))
            .unwrap();
    }
    trajectory.close(true).unwrap();

    let mut reader = Trajectory::open_read(&path, options).unwrap();
    let joints = reader.get("joint_angles").unwrap();
    assert_eq!(joints.shape(), &[2, 7]);
    assert!(matches!(
        reader.get("missing"),
        Err(TrajectoryError::FeatureMissing(_))
    ));

    let exported = dir.path().join("episode.h5");
    reader.to_hdf5(&exported).unwrap();
    assert!(exported.exists());
    assert!(!reader.cache_path().exists());
}

#[test]
fn test_empty_trajectory_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    trajectory.close(true).unwrap();

    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    assert!(reopened.load().unwrap().is_empty());
}

#[test]
fn test_read_mode_requires_existing_file() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.vla");
    let err = Trajectory::open_read(&missing, scratch_options(&dir, false)).unwrap_err();
    assert!(matches!(err, TrajectoryError::FileMissing(_)));
}

#[test]
fn test_pre_registered_streams_encode_during_capture() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut schema = BTreeMap::new();
    schema.insert(
        "img".to_string(),
        vla_codec_rs::FeatureType::new(vla_codec_rs::Dtype::Uint8, vec![100, 100, 3]),
    );

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    trajectory.init_feature_streams(&schema).unwrap();
    for step in 0..3i64 {
        trajectory
            .add("img", Array3::<u8>::from_elem((100, 100, 3), 7), Some(step))
            .unwrap();
    }
    trajectory.close(true).unwrap();

    ffmpeg::init().unwrap();
    let container = ffmpeg::format::input(&path).unwrap();
    let stream = container.streams().next().unwrap();
    assert_eq!(stream.parameters().id(), ffmpeg::codec::Id::FFV1);
    drop(container);

    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    let data = reopened.load().unwrap();
    let decoded = data["img"].as_uint8().unwrap();
    assert_eq!(decoded.shape(), &[3, 100, 100, 3]);
    assert!(decoded.iter().all(|&v| v == 7));
}

#[test]
fn test_stream_info_sidecar_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("episode.vla");
    let options = scratch_options(&dir, false);

    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    trajectory.add("a", 1.0f64, None).unwrap();
    trajectory.save_stream_info().unwrap();
    trajectory.close(true).unwrap();

    let mut reopened = Trajectory::open_read(&path, options).unwrap();
    reopened.load_stream_info().unwrap();
}

#[test]
fn test_lossless_flag_drives_codec_selection() {
    // boundary cases from the selector, end to end
    let dir = TempDir::new().unwrap();
    let options = scratch_options(&dir, false);

    let path = dir.path().join("small.vla");
    let mut trajectory = Trajectory::open_write(&path, options.clone()).unwrap();
    trajectory
        .add("img", Array3::<u8>::zeros((99, 100, 3)), None)
        .unwrap();
    trajectory.close(true).unwrap();

    ffmpeg::init().unwrap();
    let container = ffmpeg::format::input(&path).unwrap();
    let stream = container.streams().next().unwrap();
    // one dimension under the threshold keeps the stream pickled
    assert_eq!(stream.parameters().id(), ffmpeg::codec::Id::RAWVIDEO);
    assert_eq!(
        Encoding::from_codec_id(stream.parameters().id()),
        Some(Encoding::Rawvideo)
    );
}
