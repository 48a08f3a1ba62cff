//! Rename-aside remux protocols.
//!
//! Containers cannot grow streams once their header is written, so both
//! mid-session stream addition and close-time transcoding rebuild the file:
//! rename it aside, open it for reading, write a fresh container at the
//! original path, map old stream indices to new streams, and move every
//! packet across. On success the renamed original is deleted; on failure it
//! remains as the recovery point.

use std::collections::BTreeMap;
use std::fs;

use ffmpeg_next as ffmpeg;

use ffmpeg::{format, Dictionary};
use tracing::{debug, trace, warn};

use crate::codec::frame::{self, StreamEncoder};
use crate::codec::{select_encoding, Encoding};
use crate::error::TrajectoryError;
use crate::trajectory::{
    add_stream, sidecar_path, Trajectory, CONTAINER_FORMAT, FEATURE_NAME_KEY, FEATURE_TYPE_KEY,
};
use crate::{FeatureType, TIME_BASE};

/// A destination stream during the close-time transcode pass.
struct TranscodeTarget {
    index: usize,
    encoder: Option<StreamEncoder>,
    source_raw: bool,
}

impl Trajectory {
    /// Rewrite the container with an additional stream for `feature`.
    ///
    /// The current container is flushed and closed (without compaction),
    /// renamed aside, and every existing stream is recreated verbatim in a
    /// fresh container before the new stream is appended and all packets are
    /// remuxed across.
    pub(crate) fn rebuild_with_stream(
        &mut self,
        feature: &str,
        encoding: Encoding,
        feature_type: &FeatureType,
    ) -> Result<(), TrajectoryError> {
        let ending_ts = self.now_ms();
        self.flush_container(ending_ts)?;
        self.container = None;

        let temp_path = sidecar_path(&self.path, ".temp");
        fs::rename(&self.path, &temp_path)?;

        let mut original =
            format::input(&temp_path).map_err(|source| TrajectoryError::DecodeFailed {
                path: temp_path.clone(),
                source,
            })?;
        let mut rebuilt = format::output_as(&self.path, CONTAINER_FORMAT).map_err(|source| {
            TrajectoryError::FileCreateFailed {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut stream_map: BTreeMap<usize, usize> = BTreeMap::new();
        for source_stream in original.streams() {
            let feature_name = match source_stream.metadata().get(FEATURE_NAME_KEY) {
                Some(name) => name.to_string(),
                None => {
                    debug!(
                        index = source_stream.index(),
                        "skipping stream without feature name"
                    );
                    continue;
                }
            };
            let mut counterpart =
                rebuilt.add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))?;
            counterpart.set_parameters(source_stream.parameters());
            crate::ffi::clear_codec_tag(&mut counterpart);
            let mut metadata = Dictionary::new();
            for (key, value) in source_stream.metadata().iter() {
                metadata.set(key, value);
            }
            counterpart.set_metadata(metadata);
            counterpart.set_time_base(TIME_BASE);
            trace!(feature = %feature_name, "recreated stream in rebuilt container");
            stream_map.insert(source_stream.index(), counterpart.index());
        }

        let (new_index, encoder) = add_stream(&mut rebuilt, feature, encoding, feature_type)?;
        rebuilt.write_header()?;

        for (source_stream, mut packet) in original.packets() {
            if packet.pts().is_none() || packet.dts().is_none() {
                trace!("skipping packet without pts/dts");
                continue;
            }
            let target = match stream_map.get(&source_stream.index()) {
                Some(target) => *target,
                None => continue,
            };
            packet.set_stream(target);
            packet.set_position(-1);
            packet.write_interleaved(&mut rebuilt)?;
        }

        drop(original);
        fs::remove_file(&temp_path)?;

        let global_header = rebuilt
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        // adopt the rebuilt container: stream indices may have shifted when
        // unlabeled streams were dropped
        let remapped_streams: BTreeMap<String, usize> = self
            .feature_streams
            .iter()
            .filter_map(|(name, old_index)| {
                stream_map
                    .get(old_index)
                    .map(|new_index| (name.clone(), *new_index))
            })
            .collect();
        let remapped_info: BTreeMap<usize, _> = self
            .stream_info
            .iter()
            .filter_map(|(old_index, info)| {
                stream_map
                    .get(old_index)
                    .map(|new_index| (*new_index, info.clone()))
            })
            .collect();
        self.feature_streams = remapped_streams;
        self.stream_info = remapped_info;
        self.container = Some(rebuilt);
        self.header_written = true;
        self.is_closed = false;

        // encoders drained during the flush are replaced with fresh contexts
        // feeding the recreated streams
        let live: Vec<String> = self.encoders.keys().cloned().collect();
        for name in live {
            let info = self
                .feature_streams
                .get(&name)
                .and_then(|index| self.stream_info.get(index))
                .cloned();
            if let Some(info) = info {
                let encoder = StreamEncoder::new(info.encoding, &info.feature_type, global_header)?;
                self.encoders.insert(name, encoder);
            }
        }

        self.register_stream(feature, new_index, encoding, feature_type, encoder);
        Ok(())
    }

    /// Upgrade deferred streams to their final encoding after the container
    /// has been sealed.
    ///
    /// Streams that captured as `rawvideo` but select a video codec are
    /// re-encoded packet by packet at the original timestamps; everything
    /// else is remuxed verbatim. Drained tail packets land at `ending_ts`.
    pub(crate) fn transcode_deferred_streams(
        &mut self,
        ending_ts: i64,
    ) -> Result<(), TrajectoryError> {
        let temp_path = sidecar_path(&self.path, ".temp");
        fs::rename(&self.path, &temp_path)?;

        let mut original =
            format::input(&temp_path).map_err(|source| TrajectoryError::DecodeFailed {
                path: temp_path.clone(),
                source,
            })?;
        let mut compacted = format::output_as(&self.path, CONTAINER_FORMAT).map_err(|source| {
            TrajectoryError::FileCreateFailed {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut targets: BTreeMap<usize, TranscodeTarget> = BTreeMap::new();
        for source_stream in original.streams() {
            let feature_name = match source_stream.metadata().get(FEATURE_NAME_KEY) {
                Some(name) => name.to_string(),
                None => {
                    debug!(
                        index = source_stream.index(),
                        "skipping stream without feature name"
                    );
                    continue;
                }
            };
            let feature_type = match self.feature_types.get(&feature_name) {
                Some(feature_type) => feature_type.clone(),
                None => match source_stream.metadata().get(FEATURE_TYPE_KEY) {
                    Some(text) => text.parse()?,
                    None => {
                        warn!(feature = %feature_name, "skipping stream without feature type");
                        continue;
                    }
                },
            };

            let final_encoding = select_encoding(&feature_type, self.lossy_compression);
            let source_raw = source_stream.parameters().id() == ffmpeg::codec::Id::RAWVIDEO;

            let (index, encoder) = if source_raw && final_encoding.is_video() {
                debug!(
                    feature = %feature_name,
                    codec = final_encoding.codec_name(),
                    "transcoding pickled stream to video"
                );
                add_stream(&mut compacted, &feature_name, final_encoding, &feature_type)?
            } else {
                let mut counterpart =
                    compacted.add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))?;
                counterpart.set_parameters(source_stream.parameters());
                crate::ffi::clear_codec_tag(&mut counterpart);
                counterpart.set_time_base(TIME_BASE);
                (counterpart.index(), None)
            };

            // the source stream's metadata wins wholesale, like any remux
            let mut metadata = Dictionary::new();
            for (key, value) in source_stream.metadata().iter() {
                metadata.set(key, value);
            }
            if let Some(mut stream) = compacted.stream_mut(index) {
                stream.set_metadata(metadata);
            }

            targets.insert(
                source_stream.index(),
                TranscodeTarget {
                    index,
                    encoder,
                    source_raw,
                },
            );
        }

        compacted.write_header()?;

        for (source_stream, mut packet) in original.packets() {
            let pts = match packet.pts() {
                Some(pts) if packet.dts().is_some() => pts,
                _ => {
                    trace!("skipping packet without pts/dts");
                    continue;
                }
            };
            let target = match targets.get_mut(&source_stream.index()) {
                Some(target) => target,
                None => continue,
            };
            let pickled = if target.source_raw && target.encoder.is_some() {
                match packet.data() {
                    Some(bytes) if !bytes.is_empty() => Some(frame::unpickle_value(bytes)?),
                    _ => None,
                }
            } else {
                None
            };
            match (pickled, target.encoder.as_mut()) {
                (Some(value), Some(encoder)) => {
                    for mut encoded in encoder.encode(&value, pts)? {
                        encoded.set_pts(Some(pts));
                        encoded.set_dts(Some(pts));
                        encoded.set_stream(target.index);
                        encoded.set_position(-1);
                        encoded.write_interleaved(&mut compacted)?;
                    }
                }
                _ => {
                    packet.set_stream(target.index);
                    packet.set_position(-1);
                    packet.write_interleaved(&mut compacted)?;
                }
            }
        }

        for target in targets.values_mut() {
            if let Some(encoder) = target.encoder.as_mut() {
                for mut packet in encoder.drain()? {
                    packet.set_pts(Some(ending_ts));
                    packet.set_dts(Some(ending_ts));
                    packet.set_stream(target.index);
                    packet.set_position(-1);
                    packet.write_interleaved(&mut compacted)?;
                }
            }
        }

        compacted.write_trailer()?;
        drop(original);
        fs::remove_file(&temp_path)?;
        Ok(())
    }
}
