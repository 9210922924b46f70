//! Encoder catalogue, probing and selection

pub mod codec;
pub mod probe;
pub mod selector;

pub use codec::{
    build_two_pass_args, build_video_args, Codec, CodecSpec, EncoderFamily, RateControl,
};
pub use probe::{EncoderCapability, EncoderProbe, ProbeMode};
pub use selector::{is_hardware_encoder, EncoderListing, EncoderSelector};
