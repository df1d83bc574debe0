pub mod stream_decoder;

pub use stream_decoder::{StreamDecoder, StreamEvent, decode_stream, parse_event_line};
