//! The Message Table (spec §4.3): a declarative registry of every logical
//! message this core speaks, plus the wrap/unwrap/classify operations built
//! on it. Framing itself is handled by `coap-lite`; this module owns the
//! mapping between a logical name and the CoAP code/URI/token shape.

use coap_lite::{CoapOption, CoapRequest, MessageClass, Packet, PacketType, RequestType, ResponseType};

use crate::error::CoapError;

use super::message::{CoapCode, Confirmability, Message};

/// Every logical message name this core produces or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageName {
    Hello,
    Describe,
    DescribeReturn,
    VariableRequest,
    VariableValue,
    FunctionCall,
    FunctionReturn,
    SignalStart,
    SignalStartReturn,
    UpdateBegin,
    UpdateReady,
    Chunk,
    ChunkReceived,
    ChunkMissed,
    UpdateDone,
    UpdateDoneAck,
    EventPublish,
    EventAck,
    PingAck,
    GetTime,
    GetTimeReturn,
    PublicEvent,
    PrivateEvent,
}

impl MessageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageName::Hello => "Hello",
            MessageName::Describe => "Describe",
            MessageName::DescribeReturn => "DescribeReturn",
            MessageName::VariableRequest => "VariableRequest",
            MessageName::VariableValue => "VariableValue",
            MessageName::FunctionCall => "FunctionCall",
            MessageName::FunctionReturn => "FunctionReturn",
            MessageName::SignalStart => "SignalStart",
            MessageName::SignalStartReturn => "SignalStartReturn",
            MessageName::UpdateBegin => "UpdateBegin",
            MessageName::UpdateReady => "UpdateReady",
            MessageName::Chunk => "Chunk",
            MessageName::ChunkReceived => "ChunkReceived",
            MessageName::ChunkMissed => "ChunkMissed",
            MessageName::UpdateDone => "UpdateDone",
            MessageName::UpdateDoneAck => "UpdateDoneAck",
            MessageName::EventPublish => "EventPublish",
            MessageName::EventAck => "EventAck",
            MessageName::PingAck => "PingAck",
            MessageName::GetTime => "GetTime",
            MessageName::GetTimeReturn => "GetTimeReturn",
            MessageName::PublicEvent => "PublicEvent",
            MessageName::PrivateEvent => "PrivateEvent",
        }
    }
}

/// One row of the Message Table.
struct TableEntry {
    name: MessageName,
    code: CoapCode,
    confirmable: Confirmability,
    token_bearing: bool,
    /// URI path prefix used to recognize this message when classifying an
    /// inbound request. Empty for messages that are never classified by
    /// path (responses, acks).
    uri_prefix: &'static str,
}

const TABLE: &[TableEntry] = &[
    TableEntry { name: MessageName::Hello, code: CoapCode::Empty, confirmable: Confirmability::NonConfirmable, token_bearing: false, uri_prefix: "h" },
    TableEntry { name: MessageName::Describe, code: CoapCode::Get, confirmable: Confirmability::Confirmable, token_bearing: true, uri_prefix: "d" },
    TableEntry { name: MessageName::DescribeReturn, code: CoapCode::Success(5), confirmable: Confirmability::Acknowledgement, token_bearing: true, uri_prefix: "" },
    TableEntry { name: MessageName::VariableRequest, code: CoapCode::Get, confirmable: Confirmability::Confirmable, token_bearing: true, uri_prefix: "v/" },
    TableEntry { name: MessageName::VariableValue, code: CoapCode::Success(5), confirmable: Confirmability::Acknowledgement, token_bearing: true, uri_prefix: "" },
    TableEntry { name: MessageName::FunctionCall, code: CoapCode::Post, confirmable: Confirmability::Confirmable, token_bearing: true, uri_prefix: "f/" },
    TableEntry { name: MessageName::FunctionReturn, code: CoapCode::Success(4), confirmable: Confirmability::Acknowledgement, token_bearing: true, uri_prefix: "" },
    TableEntry { name: MessageName::SignalStart, code: CoapCode::Put, confirmable: Confirmability::Confirmable, token_bearing: true, uri_prefix: "s" },
    TableEntry { name: MessageName::SignalStartReturn, code: CoapCode::Success(4), confirmable: Confirmability::Acknowledgement, token_bearing: true, uri_prefix: "" },
    TableEntry { name: MessageName::UpdateBegin, code: CoapCode::Post, confirmable: Confirmability::Confirmable, token_bearing: true, uri_prefix: "u/begin" },
    TableEntry { name: MessageName::UpdateReady, code: CoapCode::Success(4), confirmable: Confirmability::Acknowledgement, token_bearing: true, uri_prefix: "" },
    TableEntry { name: MessageName::Chunk, code: CoapCode::Post, confirmable: Confirmability::Confirmable, token_bearing: true, uri_prefix: "u/c" },
    TableEntry { name: MessageName::ChunkReceived, code: CoapCode::Success(4), confirmable: Confirmability::Acknowledgement, token_bearing: true, uri_prefix: "" },
    TableEntry { name: MessageName::ChunkMissed, code: CoapCode::Get, confirmable: Confirmability::Confirmable, token_bearing: false, uri_prefix: "u/cm" },
    TableEntry { name: MessageName::UpdateDone, code: CoapCode::Put, confirmable: Confirmability::Confirmable, token_bearing: true, uri_prefix: "u/done" },
    TableEntry { name: MessageName::UpdateDoneAck, code: CoapCode::Success(4), confirmable: Confirmability::Acknowledgement, token_bearing: true, uri_prefix: "" },
    TableEntry { name: MessageName::EventPublish, code: CoapCode::Post, confirmable: Confirmability::Confirmable, token_bearing: false, uri_prefix: "e/" },
    TableEntry { name: MessageName::EventAck, code: CoapCode::Success(4), confirmable: Confirmability::Acknowledgement, token_bearing: false, uri_prefix: "" },
    TableEntry { name: MessageName::PingAck, code: CoapCode::Empty, confirmable: Confirmability::Acknowledgement, token_bearing: false, uri_prefix: "" },
    TableEntry { name: MessageName::GetTime, code: CoapCode::Get, confirmable: Confirmability::NonConfirmable, token_bearing: false, uri_prefix: "t" },
    TableEntry { name: MessageName::GetTimeReturn, code: CoapCode::Success(5), confirmable: Confirmability::NonConfirmable, token_bearing: false, uri_prefix: "" },
    TableEntry { name: MessageName::PublicEvent, code: CoapCode::Post, confirmable: Confirmability::NonConfirmable, token_bearing: false, uri_prefix: "e/" },
    TableEntry { name: MessageName::PrivateEvent, code: CoapCode::Post, confirmable: Confirmability::NonConfirmable, token_bearing: false, uri_prefix: "private/e/" },
];

fn entry(name: MessageName) -> &'static TableEntry {
    TABLE
        .iter()
        .find(|e| e.name == name)
        .expect("every MessageName has a table entry")
}

/// Whether the table requires `name` to carry a token when sent (spec §3's
/// `pendingTokens` is only ever keyed by these).
pub fn is_token_bearing(name: MessageName) -> bool {
    entry(name).token_bearing
}

/// An introspected function argument signature: ordered (name, type) pairs,
/// e.g. `functionState.f[name].args` in the old describe-payload form.
pub type ArgSpec = Vec<(Option<String>, String)>;

/// Encodes function-call arguments into a URI-query string per the declared
/// argument types (spec §4.3's `buildArguments`).
pub fn build_arguments(args: &[String], spec: &ArgSpec) -> String {
    spec.iter()
        .zip(args.iter())
        .map(|((_, ty), value)| encode_argument(ty, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode_argument(ty: &str, value: &str) -> String {
    match ty {
        "int32" | "int" => format!("i={value}"),
        "double" => format!("d={value}"),
        _ => format!("s={}", url_escape(value)),
    }
}

fn url_escape(value: &str) -> String {
    value.replace('%', "%25").replace('&', "%26").replace('=', "%3D")
}

/// A variable/function-return payload decoded per its declared type (spec
/// §4.3's `fromBinary`).
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Int32(i32),
    Str(String),
    Double(f64),
    Bytes(Vec<u8>),
}

/// Decodes a variable/function-return payload into its typed result.
pub fn from_binary(bytes: &[u8], type_name: &str) -> Result<DecodedValue, CoapError> {
    match type_name {
        "int32" | "int" => {
            let word: [u8; 4] = bytes
                .get(0..4)
                .ok_or_else(|| CoapError::Codec("int32 payload too short".into()))?
                .try_into()
                .unwrap();
            Ok(DecodedValue::Int32(i32::from_be_bytes(word)))
        }
        "double" => {
            let word: [u8; 8] = bytes
                .get(0..8)
                .ok_or_else(|| CoapError::Codec("double payload too short".into()))?
                .try_into()
                .unwrap();
            Ok(DecodedValue::Double(f64::from_be_bytes(word)))
        }
        "string" => Ok(DecodedValue::Str(String::from_utf8_lossy(bytes).into_owned())),
        _ => Ok(DecodedValue::Bytes(bytes.to_vec())),
    }
}

/// Normalizes integer-type tags from a describe response's variable map:
/// older devices report a bare `"int"`, which this core treats the same as
/// `"int32"` (spec §4.3's `translateIntTypes`).
pub fn translate_int_types(variables: &mut serde_json::Map<String, serde_json::Value>) {
    for value in variables.values_mut() {
        if let serde_json::Value::String(type_name) = value {
            if type_name == "int" {
                *type_name = "int32".to_string();
            }
        }
    }
}

/// The response-type a request's eventual reply is classified as, per spec
/// §4.3's `classify` combining code inspection with a token lookup.
pub fn response_type_for(request: MessageName) -> Option<MessageName> {
    use MessageName::*;
    match request {
        Describe => Some(DescribeReturn),
        VariableRequest => Some(VariableValue),
        FunctionCall => Some(FunctionReturn),
        SignalStart => Some(SignalStartReturn),
        UpdateBegin => Some(UpdateReady),
        Chunk => Some(ChunkReceived),
        UpdateDone => Some(UpdateDoneAck),
        GetTime => Some(GetTimeReturn),
        _ => None,
    }
}

/// Per-call dynamic parameters the static table can't express, modeled as an
/// explicit tagged variant (DESIGN NOTES §9) instead of injecting closures
/// into a parameter map.
pub enum WrapParams {
    None,
    VariableName(String),
    Function { name: String, args_query: String },
    Signal { on: bool },
    UpdateBegin { store: u8, address: String, size: u32 },
    Chunk { index: u32, crc: u32 },
    Event { name: String, max_age: Option<u32>, timestamp: Option<u64> },
}

fn coap_code_to_message_class(code: CoapCode) -> MessageClass {
    match code {
        CoapCode::Empty => MessageClass::Empty,
        CoapCode::Get => MessageClass::Request(RequestType::Get),
        CoapCode::Post => MessageClass::Request(RequestType::Post),
        CoapCode::Put => MessageClass::Request(RequestType::Put),
        CoapCode::Delete => MessageClass::Request(RequestType::Delete),
        CoapCode::Success(detail) => MessageClass::Response(success_detail(detail)),
        CoapCode::ClientError(_) => MessageClass::Response(ResponseType::BadRequest),
        CoapCode::ServerError(_) => MessageClass::Response(ResponseType::InternalServerError),
    }
}

fn success_detail(detail: u8) -> ResponseType {
    match detail {
        1 => ResponseType::Created,
        2 => ResponseType::Deleted,
        3 => ResponseType::Valid,
        4 => ResponseType::Changed,
        _ => ResponseType::Content,
    }
}

fn packet_type_for(confirmable: Confirmability) -> PacketType {
    match confirmable {
        Confirmability::Confirmable => PacketType::Confirmable,
        Confirmability::NonConfirmable => PacketType::NonConfirmable,
        Confirmability::Acknowledgement => PacketType::Acknowledgement,
        Confirmability::Reset => PacketType::Reset,
    }
}

fn apply_params(packet: &mut Packet, name: MessageName, params: &WrapParams) -> Result<(), CoapError> {
    let base = entry(name).uri_prefix;
    match (name, params) {
        (MessageName::VariableRequest, WrapParams::VariableName(var)) => {
            packet.add_option(CoapOption::UriPath, format!("{base}{var}").into_bytes());
        }
        (MessageName::FunctionCall, WrapParams::Function { name: func, args_query }) => {
            packet.add_option(CoapOption::UriPath, format!("{base}{func}").into_bytes());
            packet.add_option(CoapOption::UriQuery, args_query.clone().into_bytes());
        }
        (MessageName::SignalStart, WrapParams::Signal { on }) => {
            packet.add_option(CoapOption::UriPath, base.as_bytes().to_vec());
            packet.add_option(
                CoapOption::UriQuery,
                format!("nyan={}", if *on { 1 } else { 0 }).into_bytes(),
            );
        }
        (MessageName::UpdateBegin, WrapParams::UpdateBegin { .. }) => {
            packet.add_option(CoapOption::UriPath, base.as_bytes().to_vec());
        }
        (MessageName::Chunk, WrapParams::Chunk { index, crc }) => {
            packet.add_option(CoapOption::UriPath, base.as_bytes().to_vec());
            packet.add_option(
                CoapOption::UriQuery,
                format!("idx={index}&crc={crc:08x}").into_bytes(),
            );
        }
        (MessageName::PublicEvent, WrapParams::Event { name: event, max_age, timestamp })
        | (MessageName::PrivateEvent, WrapParams::Event { name: event, max_age, timestamp }) => {
            packet.add_option(CoapOption::UriPath, format!("{base}{event}").into_bytes());
            if let Some(max_age) = max_age {
                packet.add_option(CoapOption::MaxAge, max_age.to_be_bytes().to_vec());
            }
            if let Some(ts) = timestamp {
                packet.add_option(CoapOption::Unknown(2100), ts.to_be_bytes().to_vec());
            }
        }
        (_, WrapParams::None) if !base.is_empty() => {
            packet.add_option(CoapOption::UriPath, base.as_bytes().to_vec());
        }
        (_, WrapParams::None) => {}
        _ => return Err(CoapError::Codec(format!("params do not match {name:?}"))),
    }
    Ok(())
}

/// Builds a CoAP packet per the table; mirrors spec §4.3's `wrap`.
pub fn wrap(
    name: MessageName,
    message_id: u16,
    token: Option<u8>,
    params: WrapParams,
    payload: Vec<u8>,
) -> Result<Vec<u8>, CoapError> {
    let row = entry(name);
    if token.is_some() != row.token_bearing && row.token_bearing {
        return Err(CoapError::Codec(format!("{name:?} requires a token")));
    }
    let mut packet = Packet::new();
    packet.header.set_version(1);
    packet.header.set_type(packet_type_for(row.confirmable));
    packet.header.code = coap_code_to_message_class(row.code);
    packet.header.message_id = message_id;
    if let Some(token) = token {
        packet.set_token(vec![token]);
    }
    apply_params(&mut packet, name, &params)?;
    packet.payload = payload;
    packet
        .to_bytes()
        .map_err(|e| CoapError::Codec(e.to_string()))
}

fn message_class_to_code(class: MessageClass) -> CoapCode {
    match class {
        MessageClass::Empty => CoapCode::Empty,
        MessageClass::Request(RequestType::Get) => CoapCode::Get,
        MessageClass::Request(RequestType::Post) => CoapCode::Post,
        MessageClass::Request(RequestType::Put) => CoapCode::Put,
        MessageClass::Request(RequestType::Delete) => CoapCode::Delete,
        MessageClass::Request(_) => CoapCode::Get,
        MessageClass::Response(resp) => match resp {
            ResponseType::Created
            | ResponseType::Deleted
            | ResponseType::Valid
            | ResponseType::Changed
            | ResponseType::Content => CoapCode::Success(resp as u8 & 0x1f),
            ResponseType::BadRequest
            | ResponseType::Unauthorized
            | ResponseType::BadOption
            | ResponseType::Forbidden
            | ResponseType::NotFound
            | ResponseType::MethodNotAllowed
            | ResponseType::NotAcceptable
            | ResponseType::Conflict
            | ResponseType::PreconditionFailed
            | ResponseType::RequestEntityTooLarge
            | ResponseType::UnsupportedContentFormat
            | ResponseType::RequestHeaderFieldsTooLarge => CoapCode::ClientError(resp as u8 & 0x1f),
            _ => CoapCode::ServerError(5),
        },
        MessageClass::Reserved(_) => CoapCode::Empty,
    }
}

fn packet_confirmability(packet: &Packet) -> Confirmability {
    match packet.header.get_type() {
        PacketType::Confirmable => Confirmability::Confirmable,
        PacketType::NonConfirmable => Confirmability::NonConfirmable,
        PacketType::Acknowledgement => Confirmability::Acknowledgement,
        PacketType::Reset => Confirmability::Reset,
    }
}

/// Parses raw bytes into a `Message`; `None` on malformed input (spec §4.3's
/// `unwrap`, which is null-on-malformed rather than erroring, since a bad
/// frame is dropped and logged, not fatal).
pub fn unwrap(bytes: &[u8]) -> Option<Message> {
    let packet = Packet::from_bytes(bytes).ok()?;
    let mut request = CoapRequest::from_packet(packet.clone(), "0.0.0.0:0".parse().ok()?);
    let uri_path = request.get_path();
    let uri_query = packet
        .get_option(CoapOption::UriQuery)
        .and_then(|values| values.front().cloned())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    let max_age = packet
        .get_option(CoapOption::MaxAge)
        .and_then(|values| values.front().cloned())
        .and_then(|bytes| bytes.get(0..4).map(|b| u32::from_be_bytes(b.try_into().unwrap())));
    let _ = &mut request;
    Some(Message {
        code: message_class_to_code(packet.header.code),
        message_id: packet.header.message_id,
        token: packet.get_token().to_vec(),
        uri_path,
        uri_query,
        payload: packet.payload.clone(),
        max_age,
        timestamp: Message::now(),
        confirmability: packet_confirmability(&packet),
    })
}

/// The result of classifying an inbound `Message` (spec §4.3's `classify`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Request { name: Option<MessageName> },
    Response { name: Option<MessageName> },
    /// A confirming ack for a message this session sent; `name` is the
    /// response-type resolved from the piggybacked token, or `None` for a
    /// bare ack with no payload (falls back to `PingAck`).
    Ack { name: Option<MessageName> },
    EmptyPing,
}

/// Classifies an inbound message; `token_lookup` resolves a live token back
/// to the request name that allocated it (spec §3's `pendingTokens`).
pub fn classify(msg: &Message, token_lookup: impl Fn(u8) -> Option<MessageName>) -> Classification {
    // A live token only ever maps back to the *request* it was allocated
    // for (spec §3's `pendingTokens`); callers listen for the response-type
    // name, so every lookup here is followed through `response_type_for`.
    let response_name = || {
        msg.token_key()
            .and_then(&token_lookup)
            .and_then(response_type_for)
    };
    if matches!(msg.confirmability, Confirmability::Acknowledgement) {
        return Classification::Ack { name: response_name() };
    }
    if msg.code.is_empty() && matches!(msg.confirmability, Confirmability::Confirmable) {
        return Classification::EmptyPing;
    }
    if msg.code.is_request() {
        let name = TABLE
            .iter()
            .filter(|e| !e.uri_prefix.is_empty())
            .find(|e| msg.uri_path.starts_with(e.uri_prefix))
            .map(|e| e.name);
        return Classification::Request { name };
    }
    if msg.code.is_response() {
        return Classification::Response { name: response_name() };
    }
    Classification::Ack { name: None }
}
