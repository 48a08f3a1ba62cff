//! Encoding and decoding between in-memory values and container packets.
//!
//! `rawvideo` streams carry pickled [`Value`]s as opaque packet bodies. Video
//! streams carry frames: uint8 features as RGB24, float32 features as
//! single-channel gray (first channel of 3-D input, scaled by 255). Frames
//! are reformatted to the opened encoder's pixel format on the way in and
//! back to RGB24/GRAY8 on the way out.

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::Parameters;
use ffmpeg::format::stream::StreamMut;
use ffmpeg::software::scaling::{context::Context as Scaler, flag::Flags};
use ffmpeg::util::format::Pixel;
use ffmpeg::util::frame::video::Video as Frame;
use ffmpeg::util::picture;
use ffmpeg::{Packet, Rational};
use ndarray::{ArrayD, Axis, CowArray, IxDyn};

use crate::codec::{encoder_options, encoder_pixel_format, frame_pixel_format, Encoding};
use crate::{Dtype, FeatureType, TrajectoryError, Value, TIME_BASE};

/// Serialize a value into the opaque `rawvideo` packet body.
pub(crate) fn pickle_value(value: &Value) -> Result<Vec<u8>, serde_pickle::Error> {
    serde_pickle::to_vec(value, serde_pickle::SerOptions::new())
}

/// Recover a value from an opaque `rawvideo` packet body.
pub(crate) fn unpickle_value(bytes: &[u8]) -> Result<Value, serde_pickle::Error> {
    serde_pickle::from_slice(bytes, serde_pickle::DeOptions::new())
}

/// Build the single timestamped packet carrying a pickled value.
pub(crate) fn raw_packet(value: &Value, pts: i64) -> Result<Packet, TrajectoryError> {
    let mut packet = Packet::copy(&pickle_value(value)?);
    packet.set_pts(Some(pts));
    packet.set_dts(Some(pts));
    Ok(packet)
}

fn shape_mismatch() -> TrajectoryError {
    TrajectoryError::Layout(ndarray::ShapeError::from_kind(
        ndarray::ErrorKind::IncompatibleShape,
    ))
}

/// View a value as uint8 pixel data, casting other numeric dtypes down.
fn to_uint8_pixels(value: &Value) -> Result<CowArray<'_, u8, IxDyn>, TrajectoryError> {
    match value {
        Value::ArrayUint8(a) => Ok(a.view().into()),
        Value::ArrayInt32(a) => Ok(a.mapv(|v| v as u8).into()),
        Value::ArrayInt64(a) => Ok(a.mapv(|v| v as u8).into()),
        Value::ArrayFloat32(a) => Ok(a.mapv(|v| v as u8).into()),
        Value::ArrayFloat64(a) => Ok(a.mapv(|v| v as u8).into()),
        _ => Err(TrajectoryError::NotImage(value.feature_type())),
    }
}

/// Collapse a value to a 2-D grayscale byte image: floats scale into the
/// 0..255 range, 3-D input keeps only its first channel.
fn to_gray_pixels(value: &Value) -> Result<ArrayD<u8>, TrajectoryError> {
    let scaled: ArrayD<u8> = match value {
        Value::ArrayFloat32(a) => a.mapv(|v| (v * 255.0) as u8),
        Value::ArrayFloat64(a) => a.mapv(|v| (v * 255.0) as u8),
        Value::ArrayUint8(a) => a.clone(),
        _ => return Err(TrajectoryError::NotImage(value.feature_type())),
    };
    if scaled.ndim() == 3 {
        Ok(scaled.index_axis(Axis(2), 0).to_owned().into_dyn())
    } else {
        Ok(scaled)
    }
}

/// Copy tightly packed pixel rows into a frame plane, honoring its stride.
fn fill_plane(frame: &mut Frame, data: &[u8], row_len: usize, rows: usize) {
    let stride = frame.stride(0);
    let plane = frame.data_mut(0);
    for y in 0..rows {
        plane[y * stride..y * stride + row_len]
            .copy_from_slice(&data[y * row_len..(y + 1) * row_len]);
    }
}

/// Build an RGB24 frame from an `(H, W, 3)` uint8 value.
fn rgb_frame(value: &Value) -> Result<Frame, TrajectoryError> {
    let pixels = to_uint8_pixels(value)?;
    let shape = pixels.shape().to_vec();
    if shape.len() != 3 || shape[2] != 3 {
        return Err(TrajectoryError::NotImage(value.feature_type()));
    }
    let (height, width) = (shape[0], shape[1]);
    let mut frame = Frame::new(Pixel::RGB24, width as u32, height as u32);
    let pixels = pixels.as_standard_layout();
    let data = pixels.as_slice().expect("standard-layout pixel data");
    fill_plane(&mut frame, data, width * 3, height);
    Ok(frame)
}

/// Build a GRAY8 frame from an `(H, W)` (or `(H, W, C)`) float or byte value.
fn gray_frame(value: &Value) -> Result<Frame, TrajectoryError> {
    let pixels = to_gray_pixels(value)?;
    if pixels.ndim() != 2 {
        return Err(TrajectoryError::NotImage(value.feature_type()));
    }
    let (height, width) = (pixels.shape()[0], pixels.shape()[1]);
    let mut frame = Frame::new(Pixel::GRAY8, width as u32, height as u32);
    let pixels = pixels.as_standard_layout();
    let data = pixels.as_slice().expect("standard-layout pixel data");
    fill_plane(&mut frame, data, width, height);
    Ok(frame)
}

/// Read a decoded RGB24/GRAY8 frame back into a uint8 value of the feature's
/// declared shape.
fn read_frame(frame: &Frame, feature_type: &FeatureType) -> Result<Value, TrajectoryError> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let channels = if frame.format() == Pixel::GRAY8 { 1 } else { 3 };
    let stride = frame.stride(0);
    let row_len = width * channels;
    let mut bytes = Vec::with_capacity(row_len * height);
    let plane = frame.data(0);
    for y in 0..height {
        bytes.extend_from_slice(&plane[y * stride..y * stride + row_len]);
    }
    let array = ArrayD::from_shape_vec(IxDyn(feature_type.shape()), bytes)?;
    Ok(Value::ArrayUint8(array))
}

/// An opened video encoder for one stream, with the reformatter that feeds
/// it frames in its native pixel format.
pub(crate) struct StreamEncoder {
    encoder: ffmpeg::encoder::Video,
    frame_format: Pixel,
    encoder_format: Pixel,
    width: u32,
    height: u32,
    scaler: Option<Scaler>,
}

impl StreamEncoder {
    pub(crate) fn new(
        encoding: Encoding,
        feature_type: &FeatureType,
        global_header: bool,
    ) -> Result<Self, TrajectoryError> {
        let (width, height) = feature_type
            .video_dimensions()
            .ok_or_else(|| TrajectoryError::NotImage(feature_type.clone()))?;
        let codec = ffmpeg::encoder::find_by_name(encoding.codec_name())
            .ok_or(TrajectoryError::EncoderMissing(encoding.codec_name()))?;
        let frame_format = frame_pixel_format(feature_type.dtype());
        let encoder_format = encoder_pixel_format(encoding, feature_type.dtype());

        let mut video = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        video.set_width(width);
        video.set_height(height);
        video.set_format(encoder_format);
        video.set_time_base(Rational::new(TIME_BASE.0, TIME_BASE.1));
        if global_header {
            video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = video.open_with(encoder_options(encoding))?;

        Ok(Self {
            encoder,
            frame_format,
            encoder_format,
            width,
            height,
            scaler: None,
        })
    }

    /// Stamp the opened encoder's codec parameters onto an output stream.
    pub(crate) fn set_stream_parameters(&self, stream: &mut StreamMut<'_>) {
        stream.set_parameters(&self.encoder);
    }

    /// Encode one value at `pts`, returning every packet the encoder yields.
    pub(crate) fn encode(&mut self, value: &Value, pts: i64) -> Result<Vec<Packet>, TrajectoryError> {
        let mut frame = match self.frame_format {
            Pixel::GRAY8 => gray_frame(value)?,
            _ => rgb_frame(value)?,
        };
        if frame.width() != self.width || frame.height() != self.height {
            return Err(shape_mismatch());
        }
        frame.set_pts(Some(pts));
        frame.set_kind(picture::Type::None);

        if self.frame_format != self.encoder_format {
            if self.scaler.is_none() {
                self.scaler = Some(Scaler::get(
                    self.frame_format,
                    self.width,
                    self.height,
                    self.encoder_format,
                    self.width,
                    self.height,
                    Flags::POINT,
                )?);
            }
            if let Some(scaler) = self.scaler.as_mut() {
                let mut converted = Frame::empty();
                scaler.run(&frame, &mut converted)?;
                converted.set_pts(Some(pts));
                converted.set_kind(picture::Type::None);
                frame = converted;
            }
        }

        self.encoder.send_frame(&frame)?;
        Ok(self.receive())
    }

    /// Flush the encoder. Reporting end-of-file here means the drain is
    /// already complete and is not an error.
    pub(crate) fn drain(&mut self) -> Result<Vec<Packet>, TrajectoryError> {
        match self.encoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.receive())
    }

    fn receive(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packets.push(std::mem::replace(&mut packet, Packet::empty()));
        }
        packets
    }
}

/// An opened video decoder for one stream, with the reformatter that brings
/// decoded frames back to the feature's RGB24/GRAY8 layout.
pub(crate) struct StreamDecoder {
    decoder: ffmpeg::decoder::Video,
    frame_format: Pixel,
    scaler: Option<Scaler>,
}

impl StreamDecoder {
    pub(crate) fn new(parameters: Parameters, dtype: Dtype) -> Result<Self, TrajectoryError> {
        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)?
            .decoder()
            .video()?;
        Ok(Self {
            decoder,
            frame_format: frame_pixel_format(dtype),
            scaler: None,
        })
    }

    /// Decode one packet; a single packet may yield several frames.
    pub(crate) fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, TrajectoryError> {
        self.decoder.send_packet(packet)?;
        Ok(self.receive())
    }

    /// Drain frames the decoder is still holding for reordering.
    pub(crate) fn flush(&mut self) -> Result<Vec<Frame>, TrajectoryError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.receive())
    }

    /// Convert one decoded frame into a uint8 value shaped like the feature.
    pub(crate) fn frame_to_value(
        &mut self,
        frame: &Frame,
        feature_type: &FeatureType,
    ) -> Result<Value, TrajectoryError> {
        if frame.format() == self.frame_format {
            return read_frame(frame, feature_type);
        }
        if self.scaler.is_none() {
            self.scaler = Some(Scaler::get(
                frame.format(),
                frame.width(),
                frame.height(),
                self.frame_format,
                frame.width(),
                frame.height(),
                Flags::POINT,
            )?);
        }
        let mut converted = Frame::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut converted)?;
        }
        read_frame(&converted, feature_type)
    }

    fn receive(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut frame = Frame::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            frames.push(std::mem::replace(&mut frame, Frame::empty()));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, Array3};

    #[test]
    fn test_pickle_round_trip_scalars() {
        let values = [
            Value::from(7u8),
            Value::from(-3i32),
            Value::from(1i64 << 40),
            Value::from(0.25f32),
            Value::from(-0.5f64),
            Value::from(true),
            Value::from("pick and place"),
        ];
        for value in values {
            let bytes = pickle_value(&value).unwrap();
            assert_eq!(unpickle_value(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_pickle_round_trip_arrays() {
        let values = [
            Value::from(Array1::<f32>::ones(7)),
            Value::from(Array2::<f64>::eye(4)),
            Value::from(Array3::<u8>::from_elem((2, 3, 3), 9)),
            Value::from(Array1::<bool>::from_elem(3, true)),
        ];
        for value in values {
            let bytes = pickle_value(&value).unwrap();
            assert_eq!(unpickle_value(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_gray_pixels_take_first_channel_and_scale() {
        let mut depth = Array3::<f32>::zeros((2, 2, 3));
        depth.fill(0.0);
        depth[[0, 0, 0]] = 1.0;
        depth[[1, 1, 0]] = 0.5;
        depth[[0, 0, 1]] = 0.75; // other channels are dropped

        let gray = to_gray_pixels(&Value::from(depth)).unwrap();
        assert_eq!(gray.shape(), &[2, 2]);
        assert_eq!(gray[[0, 0]], 255);
        assert_eq!(gray[[1, 1]], 127);
        assert_eq!(gray[[0, 1]], 0);
    }

    #[test]
    fn test_pixel_helpers_reject_scalars() {
        assert!(to_uint8_pixels(&Value::from(1.0f32)).is_err());
        assert!(to_gray_pixels(&Value::from("nope")).is_err());
    }
}
