//! The trajectory container: a single Matroska file holding one stream per
//! feature, written through a monotone millisecond clock and read back as
//! dense per-feature arrays.
//!
//! Writes always capture as `rawvideo` (pickled byte packets); the codec
//! selector's decision is deferred to the close-time compaction pass. Adding
//! a feature to a live container rewrites the file with an added stream,
//! since containers cannot grow streams after their header is written.

mod read;
mod remux;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use ffmpeg_next as ffmpeg;

use ffmpeg::format;
use ffmpeg::Dictionary;
use ffmpeg::Packet;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::DecodedCache;
use crate::codec::frame::{self, StreamEncoder};
use crate::codec::{select_encoding, Encoding};
use crate::error::TrajectoryError;
use crate::{
    flatten_columns, flatten_samples, ColumnMap, FeatureArray, FeatureType, Sample, SampleMap,
    TIME_BASE,
};

/// Stream metadata key holding the feature name.
pub const FEATURE_NAME_KEY: &str = "FEATURE_NAME";

/// Stream metadata key holding the stringified [`FeatureType`].
pub const FEATURE_TYPE_KEY: &str = "FEATURE_TYPE";

const CONTAINER_FORMAT: &str = "matroska";

/// The decoded data of a trajectory: one dense array per flat feature name.
pub type TrajectoryData = BTreeMap<String, FeatureArray>;

/// Open mode for a [`Trajectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read an existing trajectory.
    Read,
    /// Create a new trajectory for writing.
    Write,
}

impl FromStr for Mode {
    type Err = TrajectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(Mode::Read),
            "w" => Ok(Mode::Write),
            other => Err(TrajectoryError::InvalidMode(other.to_string())),
        }
    }
}

/// Construction-time options. There is no implicit global state: the cache
/// directory, compression choice and separator all arrive here.
#[derive(Debug, Clone)]
pub struct TrajectoryOptions {
    /// Where decoded caches live. Created on demand.
    pub cache_dir: PathBuf,
    /// Whether image-like features compact to AV1 (lossy) instead of FFV1.
    pub lossy_compression: bool,
    /// Separator joining nested sample names into flat feature names.
    pub feature_name_separator: String,
}

impl Default for TrajectoryOptions {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("vla-codec").join("cache"),
            lossy_compression: true,
            feature_name_separator: "/".to_string(),
        }
    }
}

/// Per-stream bookkeeping, also carried in the stream-info sidecar.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub feature_name: String,
    pub feature_type: FeatureType,
    pub encoding: Encoding,
}

/// What [`Trajectory::load_as`] should hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    /// The decoded per-feature array map.
    Arrays,
    /// The open decoded-cache file.
    Hdf5,
    /// The decoded-cache file path.
    CachePath,
    /// The container file path.
    ContainerPath,
}

/// The result of [`Trajectory::load_as`].
#[allow(missing_docs)]
pub enum LoadResult {
    Arrays(TrajectoryData),
    Hdf5(hdf5::File),
    CachePath(PathBuf),
    ContainerPath(PathBuf),
}

/// One robot episode stored as a single container file.
pub struct Trajectory {
    path: PathBuf,
    cache: DecodedCache,
    separator: String,
    lossy_compression: bool,
    mode: Mode,
    start: Instant,
    is_closed: bool,
    container: Option<format::context::Output>,
    header_written: bool,
    feature_streams: BTreeMap<String, usize>,
    feature_types: BTreeMap<String, FeatureType>,
    encoders: BTreeMap<String, StreamEncoder>,
    stream_info: BTreeMap<usize, StreamInfo>,
    data: Option<TrajectoryData>,
}

impl Trajectory {
    /// Create a new trajectory file for writing.
    pub fn open_write(
        path: impl Into<PathBuf>,
        options: TrajectoryOptions,
    ) -> Result<Self, TrajectoryError> {
        ffmpeg::init()?;
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::create_dir_all(&options.cache_dir)?;
        let container = format::output_as(&path, CONTAINER_FORMAT).map_err(|source| {
            TrajectoryError::FileCreateFailed {
                path: path.clone(),
                source,
            }
        })?;
        let cache = DecodedCache::new(&options.cache_dir, &path);
        Ok(Self {
            path,
            cache,
            separator: options.feature_name_separator,
            lossy_compression: options.lossy_compression,
            mode: Mode::Write,
            start: Instant::now(),
            is_closed: false,
            container: Some(container),
            header_written: false,
            feature_streams: BTreeMap::new(),
            feature_types: BTreeMap::new(),
            encoders: BTreeMap::new(),
            stream_info: BTreeMap::new(),
            data: None,
        })
    }

    /// Open an existing trajectory for reading.
    pub fn open_read(
        path: impl Into<PathBuf>,
        options: TrajectoryOptions,
    ) -> Result<Self, TrajectoryError> {
        ffmpeg::init()?;
        let path = path.into();
        if !path.exists() {
            return Err(TrajectoryError::FileMissing(path));
        }
        fs::create_dir_all(&options.cache_dir)?;
        let cache = DecodedCache::new(&options.cache_dir, &path);
        Ok(Self {
            path,
            cache,
            separator: options.feature_name_separator,
            lossy_compression: options.lossy_compression,
            mode: Mode::Read,
            start: Instant::now(),
            is_closed: false,
            container: None,
            header_written: false,
            feature_streams: BTreeMap::new(),
            feature_types: BTreeMap::new(),
            encoders: BTreeMap::new(),
            stream_info: BTreeMap::new(),
            data: None,
        })
    }

    /// Open with a string mode (`"r"` or `"w"`), for callers driven by
    /// external configuration.
    pub fn open(
        path: impl Into<PathBuf>,
        mode: &str,
        options: TrajectoryOptions,
    ) -> Result<Self, TrajectoryError> {
        match mode.parse::<Mode>()? {
            Mode::Read => Self::open_read(path, options),
            Mode::Write => Self::open_write(path, options),
        }
    }

    /// Path of the container file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the decoded cache beside this trajectory.
    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    /// The open mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Milliseconds of wall time since this trajectory was opened.
    pub(crate) fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// Add one value for `feature` at `timestamp` (milliseconds since the
    /// trajectory began; the current clock when `None`).
    ///
    /// Map-valued samples are rejected; flatten them through
    /// [`add_by_dict`](Self::add_by_dict) instead. The first write of an
    /// unseen feature creates its stream, rewriting the container when other
    /// streams already exist.
    pub fn add(
        &mut self,
        feature: &str,
        value: impl Into<Sample>,
        timestamp: Option<i64>,
    ) -> Result<(), TrajectoryError> {
        match value.into() {
            Sample::Map(_) => Err(TrajectoryError::InvalidValue),
            Sample::Value(value) => self.add_value(feature, &value, timestamp),
        }
    }

    /// Add one step's worth of features. Nested maps flatten into
    /// separator-joined feature names; every leaf shares the same timestamp.
    pub fn add_by_dict(
        &mut self,
        step: &SampleMap,
        timestamp: Option<i64>,
    ) -> Result<(), TrajectoryError> {
        let ts = timestamp.unwrap_or_else(|| self.now_ms());
        let separator = self.separator.clone();
        for (feature, value) in flatten_samples(step, &separator) {
            self.add_value(&feature, value, Some(ts))?;
        }
        Ok(())
    }

    pub(crate) fn add_value(
        &mut self,
        feature: &str,
        value: &crate::Value,
        timestamp: Option<i64>,
    ) -> Result<(), TrajectoryError> {
        if self.mode != Mode::Write || self.is_closed {
            return Err(TrajectoryError::NotWritable);
        }
        let feature_type = value.feature_type();
        self.feature_types
            .insert(feature.to_string(), feature_type.clone());

        // all ad-hoc features capture as rawvideo; the selector runs at
        // close time once shapes are settled
        if !self.feature_streams.contains_key(feature) {
            self.on_new_stream(feature, Encoding::Rawvideo, &feature_type)?;
        }

        let stream_index = self.feature_streams[feature];
        let ts = timestamp.unwrap_or_else(|| self.now_ms());
        let packets = match self.encoders.get_mut(feature) {
            Some(encoder) => encoder.encode(value, ts)?,
            None => vec![frame::raw_packet(value, ts)?],
        };
        self.mux(stream_index, packets, ts)
    }

    /// Pre-register a feature schema before the first write. Streams created
    /// here take their final encoding immediately, so image-like features are
    /// video-encoded during capture instead of at close time.
    pub fn init_feature_streams(
        &mut self,
        features: &BTreeMap<String, FeatureType>,
    ) -> Result<(), TrajectoryError> {
        for (feature, feature_type) in features {
            if self.feature_streams.contains_key(feature) {
                continue;
            }
            let encoding = select_encoding(feature_type, self.lossy_compression);
            if self.header_written {
                self.on_new_stream(feature, encoding, feature_type)?;
            } else {
                // the container header is still open, so streams go in directly
                let container = self.container.as_mut().ok_or(TrajectoryError::NotWritable)?;
                let (index, encoder) = add_stream(container, feature, encoding, feature_type)?;
                self.register_stream(feature, index, encoding, feature_type, encoder);
            }
            self.feature_types
                .insert(feature.clone(), feature_type.clone());
        }
        Ok(())
    }

    fn on_new_stream(
        &mut self,
        feature: &str,
        encoding: Encoding,
        feature_type: &FeatureType,
    ) -> Result<(), TrajectoryError> {
        if self.feature_streams.is_empty() {
            debug!(feature, "creating stream in fresh container");
            let container = self.container.as_mut().ok_or(TrajectoryError::NotWritable)?;
            let (index, encoder) = add_stream(container, feature, encoding, feature_type)?;
            self.register_stream(feature, index, encoding, feature_type, encoder);
        } else {
            debug!(feature, "rebuilding container to add stream");
            self.rebuild_with_stream(feature, encoding, feature_type)?;
        }
        Ok(())
    }

    pub(crate) fn register_stream(
        &mut self,
        feature: &str,
        index: usize,
        encoding: Encoding,
        feature_type: &FeatureType,
        encoder: Option<StreamEncoder>,
    ) {
        self.feature_streams.insert(feature.to_string(), index);
        self.stream_info.insert(
            index,
            StreamInfo {
                feature_name: feature.to_string(),
                feature_type: feature_type.clone(),
                encoding,
            },
        );
        if let Some(encoder) = encoder {
            self.encoders.insert(feature.to_string(), encoder);
        }
    }

    fn mux(
        &mut self,
        stream_index: usize,
        packets: Vec<Packet>,
        ts: i64,
    ) -> Result<(), TrajectoryError> {
        let container = self.container.as_mut().ok_or(TrajectoryError::NotWritable)?;
        if !self.header_written {
            container.write_header()?;
            self.header_written = true;
        }
        for mut packet in packets {
            packet.set_pts(Some(ts));
            packet.set_dts(Some(ts));
            packet.set_stream(stream_index);
            packet.set_position(-1);
            packet.write_interleaved(container)?;
        }
        Ok(())
    }

    /// Flush and seal the trajectory. With `compact` (the default for the
    /// bulk constructors), streams that captured as `rawvideo` but should be
    /// video-encoded are transcoded into their final codec. A second close
    /// is an error.
    pub fn close(&mut self, compact: bool) -> Result<(), TrajectoryError> {
        if self.is_closed {
            return Err(TrajectoryError::DoubleClose);
        }
        let ending_ts = self.now_ms();
        if self.mode == Mode::Write {
            self.flush_container(ending_ts)?;
            self.container = None;
            if compact {
                self.transcode_deferred_streams(ending_ts)?;
            }
        }
        self.data = None;
        self.is_closed = true;
        Ok(())
    }

    /// Drain live encoders, mux their tail packets at `ending_ts`, and write
    /// the container trailer.
    pub(crate) fn flush_container(&mut self, ending_ts: i64) -> Result<(), TrajectoryError> {
        let container = match self.container.as_mut() {
            Some(container) => container,
            None => return Err(TrajectoryError::NotWritable),
        };
        if !self.header_written {
            container.write_header()?;
            self.header_written = true;
        }
        for (feature, encoder) in self.encoders.iter_mut() {
            let stream_index = self.feature_streams[feature];
            for mut packet in encoder.drain()? {
                packet.set_pts(Some(ending_ts));
                packet.set_dts(Some(ending_ts));
                packet.set_stream(stream_index);
                packet.set_position(-1);
                packet.write_interleaved(container)?;
            }
        }
        debug!(path = %self.path.display(), "flushing container");
        container.write_trailer()?;
        Ok(())
    }

    /// Build a trajectory from a sequence of per-step maps.
    pub fn from_list_of_dicts(
        steps: &[SampleMap],
        path: impl Into<PathBuf>,
        lossy_compression: bool,
    ) -> Result<Self, TrajectoryError> {
        let options = TrajectoryOptions {
            lossy_compression,
            ..TrajectoryOptions::default()
        };
        let mut trajectory = Self::open_write(path, options)?;
        info!(
            path = %trajectory.path.display(),
            steps = steps.len(),
            "creating trajectory from steps"
        );
        for step in steps {
            trajectory.add_by_dict(step, None)?;
        }
        trajectory.close(true)?;
        Ok(trajectory)
    }

    /// Build a trajectory from a map of per-feature sequences. All leaf
    /// sequences must have the same length.
    pub fn from_dict_of_lists(
        columns: &ColumnMap,
        path: impl Into<PathBuf>,
        feature_name_separator: &str,
        lossy_compression: bool,
    ) -> Result<Self, TrajectoryError> {
        let options = TrajectoryOptions {
            lossy_compression,
            feature_name_separator: feature_name_separator.to_string(),
            ..TrajectoryOptions::default()
        };
        let mut trajectory = Self::open_write(path, options)?;
        let flat = flatten_columns(columns, feature_name_separator);
        if !flat.iter().map(|(_, values)| values.len()).all_equal() {
            return Err(TrajectoryError::ShapeMismatch(
                flat.iter()
                    .map(|(name, values)| (name.clone(), values.len()))
                    .collect(),
            ));
        }
        let steps = flat.first().map(|(_, values)| values.len()).unwrap_or(0);
        for i in 0..steps {
            let ts = trajectory.now_ms();
            for (feature, values) in &flat {
                trajectory.add_value(feature, &values[i], Some(ts))?;
            }
        }
        trajectory.close(true)?;
        Ok(trajectory)
    }

    /// Load the decoded per-feature arrays, populating the decoded cache on
    /// first use and serving from it afterwards.
    ///
    /// Float32 video streams decode to uint8 grayscale values widened to
    /// `f32` (0..255); the writer's `*255` scale is not inverted.
    pub fn load(&mut self) -> Result<TrajectoryData, TrajectoryError> {
        self.load_arrays(true)
    }

    /// Load with an explicit return mode, optionally skipping cache
    /// persistence.
    pub fn load_as(
        &mut self,
        return_type: ReturnType,
        save_to_cache: bool,
    ) -> Result<LoadResult, TrajectoryError> {
        match return_type {
            ReturnType::Arrays => Ok(LoadResult::Arrays(self.load_arrays(save_to_cache)?)),
            ReturnType::Hdf5 => {
                if !self.cache.exists() {
                    let data = self.load_from_container()?;
                    self.cache
                        .write(&data)
                        .map_err(TrajectoryError::CacheWriteFailed)?;
                }
                let file = self.cache.open().map_err(TrajectoryError::CacheReadFailed)?;
                Ok(LoadResult::Hdf5(file))
            }
            ReturnType::CachePath => Ok(LoadResult::CachePath(self.cache.path().to_path_buf())),
            ReturnType::ContainerPath => Ok(LoadResult::ContainerPath(self.path.clone())),
        }
    }

    /// Look up one feature's decoded array, loading (and memoizing) the
    /// trajectory data on first use.
    pub fn get(&mut self, key: &str) -> Result<&FeatureArray, TrajectoryError> {
        if self.data.is_none() {
            info!(key, "loading trajectory data");
            let data = self.load()?;
            self.data = Some(data);
        }
        match self.data.as_ref().and_then(|data| data.get(key)) {
            Some(array) => Ok(array),
            None => Err(TrajectoryError::FeatureMissing(key.to_string())),
        }
    }

    /// Move the decoded cache to `path`, producing a standalone HDF5 file.
    /// Loads (and therefore populates the cache) if that has not happened
    /// yet.
    pub fn to_hdf5(&mut self, path: impl AsRef<Path>) -> Result<(), TrajectoryError> {
        if self.data.is_none() {
            let data = self.load()?;
            self.data = Some(data);
        }
        fs::rename(self.cache.path(), path.as_ref())?;
        Ok(())
    }

    /// Persist the stream-info table to the `<path>.stream_info` sidecar.
    pub fn save_stream_info(&self) -> Result<(), TrajectoryError> {
        let bytes = serde_pickle::to_vec(&self.stream_info, serde_pickle::SerOptions::new())?;
        fs::write(sidecar_path(&self.path, ".stream_info"), bytes)?;
        Ok(())
    }

    /// Restore the stream-info table from the `<path>.stream_info` sidecar.
    pub fn load_stream_info(&mut self) -> Result<(), TrajectoryError> {
        let bytes = fs::read(sidecar_path(&self.path, ".stream_info"))?;
        self.stream_info =
            serde_pickle::from_slice(&bytes, serde_pickle::DeOptions::new())?;
        Ok(())
    }
}

/// `<path><suffix>`, preserving the existing extension.
pub(crate) fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Create a stream for `feature` in `container`, returning its index and the
/// opened encoder for video encodings.
pub(crate) fn add_stream(
    container: &mut format::context::Output,
    feature: &str,
    encoding: Encoding,
    feature_type: &FeatureType,
) -> Result<(usize, Option<StreamEncoder>), TrajectoryError> {
    let global_header = container
        .format()
        .flags()
        .contains(format::flag::Flags::GLOBAL_HEADER);
    let codec = ffmpeg::encoder::find_by_name(encoding.codec_name());
    let mut stream = container.add_stream(codec)?;

    let encoder = match encoding {
        Encoding::Rawvideo => {
            crate::ffi::set_raw_stream_parameters(&mut stream);
            None
        }
        Encoding::Ffv1 | Encoding::Av1 => {
            let encoder = StreamEncoder::new(encoding, feature_type, global_header)?;
            encoder.set_stream_parameters(&mut stream);
            Some(encoder)
        }
    };

    let mut metadata = Dictionary::new();
    metadata.set(FEATURE_NAME_KEY, feature);
    metadata.set(FEATURE_TYPE_KEY, &feature_type.to_string());
    stream.set_metadata(metadata);
    stream.set_time_base(TIME_BASE);

    Ok((stream.index(), encoder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("r".parse::<Mode>().unwrap(), Mode::Read);
        assert_eq!("w".parse::<Mode>().unwrap(), Mode::Write);
        assert!(matches!(
            "a".parse::<Mode>(),
            Err(TrajectoryError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_sidecar_path_appends_suffix() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/episode.vla"), ".temp"),
            PathBuf::from("/tmp/episode.vla.temp")
        );
        assert_eq!(
            sidecar_path(Path::new("/tmp/episode.vla"), ".stream_info"),
            PathBuf::from("/tmp/episode.vla.stream_info")
        );
    }
}
