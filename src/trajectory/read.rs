//! Dense decode of a trajectory container.
//!
//! Reading probes each stream's packet count, preallocates one `(N, *shape)`
//! array per feature, then demuxes every packet into its slot: pickled
//! bodies are deserialized directly, video packets run through the stream's
//! decoder. Results are persisted to the decoded cache and served from it on
//! later loads.

use std::collections::BTreeMap;

use ffmpeg_next as ffmpeg;

use ffmpeg::format;
use tracing::{debug, error, trace, warn};

use crate::codec::frame::{self, StreamDecoder};
use crate::codec::Encoding;
use crate::error::TrajectoryError;
use crate::trajectory::{Trajectory, TrajectoryData, FEATURE_NAME_KEY, FEATURE_TYPE_KEY};
use crate::{FeatureArray, FeatureType};

/// Decode state for one labeled stream.
struct StreamSlot {
    feature_name: String,
    feature_type: FeatureType,
    decoder: Option<StreamDecoder>,
    cursor: usize,
}

impl Trajectory {
    /// Load the decoded array map, going to the container only when the
    /// cache cannot serve the request. Cache failures are recovered: a
    /// failed write still returns the in-memory result, an unreadable cache
    /// falls back to a fresh container decode.
    pub(crate) fn load_arrays(
        &mut self,
        save_to_cache: bool,
    ) -> Result<TrajectoryData, TrajectoryError> {
        if !self.cache.exists() {
            debug!(
                container = %self.path().display(),
                cache = %self.cache_path().display(),
                "decoding container"
            );
            let data = self.load_from_container()?;
            if save_to_cache {
                if let Err(e) = self.cache.write(&data) {
                    error!(
                        cache = %self.cache_path().display(),
                        error = %e,
                        "failed to persist decoded cache"
                    );
                }
            }
            return Ok(data);
        }
        match self.cache.read() {
            Ok(data) => Ok(data),
            Err(e) => {
                error!(
                    cache = %self.cache_path().display(),
                    error = %e,
                    "decoded cache unreadable, decoding container"
                );
                self.load_from_container()
            }
        }
    }

    /// Decode every packet in the container into dense per-feature arrays.
    pub(crate) fn load_from_container(&mut self) -> Result<TrajectoryData, TrajectoryError> {
        let lengths = self.probe_stream_lengths()?;

        let path = self.path().to_path_buf();
        let mut container =
            format::input(&path).map_err(|source| TrajectoryError::DecodeFailed {
                path: path.clone(),
                source,
            })?;

        let mut slots: BTreeMap<usize, StreamSlot> = BTreeMap::new();
        let mut data: TrajectoryData = BTreeMap::new();

        for stream in container.streams() {
            let feature_name = match stream.metadata().get(FEATURE_NAME_KEY) {
                Some(name) => name.to_string(),
                None => {
                    warn!(index = stream.index(), "skipping stream without feature name");
                    continue;
                }
            };
            let feature_type: FeatureType = match stream.metadata().get(FEATURE_TYPE_KEY) {
                Some(text) => text.parse()?,
                None => {
                    warn!(feature = %feature_name, "skipping stream without feature type");
                    continue;
                }
            };
            let length = lengths.get(&stream.index()).copied().unwrap_or(0);
            debug!(
                feature = %feature_name,
                length,
                shape = ?feature_type.shape(),
                "preallocating feature array"
            );

            let decoder = match Encoding::from_codec_id(stream.parameters().id()) {
                Some(Encoding::Ffv1) | Some(Encoding::Av1) => Some(StreamDecoder::new(
                    stream.parameters(),
                    feature_type.dtype(),
                )?),
                _ => None,
            };

            self.feature_types
                .insert(feature_name.clone(), feature_type.clone());
            data.insert(
                feature_name.clone(),
                FeatureArray::empty(&feature_type, length),
            );
            slots.insert(
                stream.index(),
                StreamSlot {
                    feature_name,
                    feature_type,
                    decoder,
                    cursor: 0,
                },
            );
        }

        for (stream, packet) in container.packets() {
            let slot = match slots.get_mut(&stream.index()) {
                Some(slot) => slot,
                None => continue,
            };
            let array = match data.get_mut(&slot.feature_name) {
                Some(array) => array,
                None => continue,
            };
            match slot.decoder.as_mut() {
                None => {
                    let bytes = match packet.data() {
                        Some(bytes) if !bytes.is_empty() => bytes,
                        _ => {
                            trace!(feature = %slot.feature_name, "skipping empty packet");
                            continue;
                        }
                    };
                    let value = frame::unpickle_value(bytes)?;
                    if slot.cursor >= array.len() {
                        warn!(feature = %slot.feature_name, "more packets than probed");
                        continue;
                    }
                    array.assign_at(slot.cursor, &value)?;
                    slot.cursor += 1;
                }
                Some(decoder) => {
                    let frames = decoder.decode(&packet)?;
                    for decoded in &frames {
                        if slot.cursor >= array.len() {
                            warn!(feature = %slot.feature_name, "more frames than probed");
                            break;
                        }
                        let value = decoder.frame_to_value(decoded, &slot.feature_type)?;
                        array.assign_at(slot.cursor, &value)?;
                        slot.cursor += 1;
                    }
                }
            }
        }

        // codecs with reorder delay may still hold tail frames
        for slot in slots.values_mut() {
            let decoder = match slot.decoder.as_mut() {
                Some(decoder) => decoder,
                None => continue,
            };
            let frames = decoder.flush()?;
            let array = match data.get_mut(&slot.feature_name) {
                Some(array) => array,
                None => continue,
            };
            for decoded in &frames {
                if slot.cursor >= array.len() {
                    warn!(feature = %slot.feature_name, "more frames than probed");
                    break;
                }
                let value = decoder.frame_to_value(decoded, &slot.feature_type)?;
                array.assign_at(slot.cursor, &value)?;
                slot.cursor += 1;
            }
            trace!(
                feature = %slot.feature_name,
                decoded = slot.cursor,
                "stream fully decoded"
            );
        }

        Ok(data)
    }

    /// Count the packets carrying a decode timestamp, per stream.
    ///
    /// Counting every stream (rather than assuming the first stream's count
    /// holds for all) keeps features that joined mid-trajectory at their own
    /// length.
    fn probe_stream_lengths(&self) -> Result<BTreeMap<usize, usize>, TrajectoryError> {
        let path = self.path().to_path_buf();
        let mut container =
            format::input(&path).map_err(|source| TrajectoryError::DecodeFailed {
                path: path.clone(),
                source,
            })?;
        let mut lengths = BTreeMap::new();
        for (stream, packet) in container.packets() {
            if packet.dts().is_some() {
                *lengths.entry(stream.index()).or_insert(0) += 1;
            }
        }
        Ok(lengths)
    }
}
