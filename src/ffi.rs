//! The handful of `libavformat` pokes the safe `ffmpeg-next` surface does
//! not cover.

use ffmpeg_next as ffmpeg;

use ffmpeg::ffi::{AVCodecID, AVMediaType};
use ffmpeg::format::stream::StreamMut;

/// Stamp codec parameters onto a raw-codec output stream.
///
/// `rawvideo` streams never open an encoder (their packets are opaque byte
/// bodies built by the caller), so the codec id and medium must be written
/// into `codecpar` by hand for the muxer to accept packets on the stream.
pub(crate) fn set_raw_stream_parameters(stream: &mut StreamMut<'_>) {
    unsafe {
        let par = (*stream.as_mut_ptr()).codecpar;
        (*par).codec_type = AVMediaType::AVMEDIA_TYPE_VIDEO;
        (*par).codec_id = AVCodecID::AV_CODEC_ID_RAWVIDEO;
        (*par).codec_tag = 0;
    }
}

/// Clear the codec tag on a stream whose parameters were copied from another
/// container; a stale tag can be rejected by the destination muxer.
pub(crate) fn clear_codec_tag(stream: &mut StreamMut<'_>) {
    unsafe {
        (*(*stream.as_mut_ptr()).codecpar).codec_tag = 0;
    }
}
