pub mod message;
pub mod table;

pub use message::{CoapCode, Confirmability, Message};
pub use table::{
    build_arguments, classify, from_binary, is_token_bearing, response_type_for,
    translate_int_types, unwrap, wrap, ArgSpec, Classification, DecodedValue, MessageName,
    WrapParams,
};
