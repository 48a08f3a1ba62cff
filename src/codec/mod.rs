//! Stream encodings and the per-feature codec selector.
//!
//! At capture time every feature is written as `rawvideo` (pickled byte
//! packets); the selector's decision is applied when the trajectory is
//! compacted at close time, or up front for streams registered through
//! [`Trajectory::init_feature_streams`](crate::Trajectory::init_feature_streams).

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::Id;
use ffmpeg::util::format::Pixel;
use ffmpeg::Dictionary;
use serde::{Deserialize, Serialize};

use crate::{Dtype, FeatureType};

/// Frame encoding and decoding between values and container packets
pub mod frame;

/// The three encodings a feature stream can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Pickled byte packets, muxed without a codec.
    Rawvideo,
    /// Lossless video.
    Ffv1,
    /// Lossy video.
    Av1,
}

impl Encoding {
    /// The ffmpeg codec name used to create streams of this encoding.
    pub fn codec_name(&self) -> &'static str {
        match self {
            Encoding::Rawvideo => "rawvideo",
            Encoding::Ffv1 => "ffv1",
            Encoding::Av1 => "libaom-av1",
        }
    }

    /// Map a demuxed stream's codec id back to an encoding.
    pub fn from_codec_id(id: Id) -> Option<Self> {
        match id {
            Id::RAWVIDEO => Some(Encoding::Rawvideo),
            Id::FFV1 => Some(Encoding::Ffv1),
            Id::AV1 => Some(Encoding::Av1),
            _ => None,
        }
    }

    /// Whether packets of this encoding go through a video encoder.
    pub fn is_video(&self) -> bool {
        !matches!(self, Encoding::Rawvideo)
    }
}

/// Choose the encoding for a feature.
///
/// Image-like features (at least two dimensions, both of the first two
/// ≥ 100) are video-encoded; everything else stays `rawvideo`. The test keys
/// on shape alone: float32 depth maps are video-encoded just like uint8
/// camera frames.
pub fn select_encoding(feature_type: &FeatureType, lossy_compression: bool) -> Encoding {
    let shape = feature_type.shape();
    if shape.len() >= 2 && shape[0] >= 100 && shape[1] >= 100 {
        if lossy_compression {
            Encoding::Av1
        } else {
            Encoding::Ffv1
        }
    } else {
        Encoding::Rawvideo
    }
}

/// The pixel format frames are built in before encoding (and read back in
/// after decoding): single-channel gray for float features, RGB otherwise.
pub(crate) fn frame_pixel_format(dtype: Dtype) -> Pixel {
    match dtype {
        Dtype::Float32 => Pixel::GRAY8,
        _ => Pixel::RGB24,
    }
}

/// The pixel format the opened encoder consumes. FFV1 carries RGB as `BGR0`,
/// a pure byte shuffle away from RGB24, so the lossless path stays lossless;
/// AV1 takes planar YUV.
pub(crate) fn encoder_pixel_format(encoding: Encoding, dtype: Dtype) -> Pixel {
    match (encoding, dtype) {
        (_, Dtype::Float32) => Pixel::GRAY8,
        (Encoding::Av1, _) => Pixel::YUV420P,
        _ => Pixel::BGRZ,
    }
}

/// Encoder options for a freshly opened stream encoder.
pub(crate) fn encoder_options(encoding: Encoding) -> Dictionary<'static> {
    let mut options = Dictionary::new();
    if encoding == Encoding::Av1 {
        // keyframe every 2 frames, constant quality 23
        options.set("g", "2");
        options.set("crf", "23");
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_like_shapes_select_video() {
        let big = FeatureType::new(Dtype::Uint8, vec![100, 100, 3]);
        assert_eq!(select_encoding(&big, false), Encoding::Ffv1);
        assert_eq!(select_encoding(&big, true), Encoding::Av1);

        let depth = FeatureType::new(Dtype::Float32, vec![480, 640]);
        assert_eq!(select_encoding(&depth, false), Encoding::Ffv1);
        assert_eq!(select_encoding(&depth, true), Encoding::Av1);
    }

    #[test]
    fn test_small_shapes_stay_raw() {
        let just_under = FeatureType::new(Dtype::Uint8, vec![99, 100, 3]);
        assert_eq!(select_encoding(&just_under, false), Encoding::Rawvideo);
        assert_eq!(select_encoding(&just_under, true), Encoding::Rawvideo);

        let pose = FeatureType::new(Dtype::Float32, vec![4, 4]);
        assert_eq!(select_encoding(&pose, true), Encoding::Rawvideo);

        let scalar = FeatureType::scalar(Dtype::Float64);
        assert_eq!(select_encoding(&scalar, true), Encoding::Rawvideo);

        let vector = FeatureType::new(Dtype::Float32, vec![7]);
        assert_eq!(select_encoding(&vector, true), Encoding::Rawvideo);
    }
}
