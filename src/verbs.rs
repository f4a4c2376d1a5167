//! Device Verbs (spec §4.5): the high-level operations built on the session
//! state machine — introspection, variable reads, function calls, the
//! "nyan" signal, and the bridge for externally-published events. Every verb
//! routes through `send_message`/`reply`, which already enforce the
//! ownership gate; verbs only add the lazy-introspection and
//! argument/return codec concerns on top.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::coap::{self, DecodedValue, MessageName, WrapParams};
use crate::collaborators::CoreEvent;
use crate::error::{CoapError, SessionError};
use crate::session::{DeviceSession, Introspection, NONE_HOLDER};

fn parse_arg_array(args: &[serde_json::Value]) -> coap::ArgSpec {
    args.iter()
        .map(|pair| {
            let arr = pair.as_array();
            let arg_name = arr
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let arg_type = arr
                .and_then(|a| a.get(1))
                .and_then(|v| v.as_str())
                .unwrap_or("string")
                .to_string();
            (arg_name, arg_type)
        })
        .collect()
}

/// Resolves a function's argument signature from introspected state. The new
/// form keys directly by function name; the old form lists bare function
/// names under `f` and always implies a single string argument (spec §4.5).
fn resolve_arg_spec(function_state: &serde_json::Value, name: &str) -> Option<coap::ArgSpec> {
    if let Some(args) = function_state
        .get(name)
        .and_then(|f| f.get("args"))
        .and_then(|a| a.as_array())
    {
        return Some(parse_arg_array(args));
    }

    let f = function_state.get("f")?;
    if let Some(names) = f.as_array() {
        if names
            .iter()
            .filter_map(|v| v.as_str())
            .any(|fname| fname.eq_ignore_ascii_case(name))
        {
            return Some(vec![(None, "string".to_string())]);
        }
    } else if let Some(entries) = f.as_object() {
        for (fname, descriptor) in entries {
            if fname.eq_ignore_ascii_case(name) {
                if let Some(args) = descriptor.get("args").and_then(|a| a.as_array()) {
                    return Some(parse_arg_array(args));
                }
                return Some(vec![(None, "string".to_string())]);
            }
        }
    }
    None
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Ensures `introspection()` is populated, running `describe` if not.
    pub async fn ensure_introspection(&self) -> Result<Introspection, SessionError> {
        if let Some(introspection) = self.introspection() {
            return Ok(introspection);
        }
        self.describe().await
    }

    /// Runs the device's self-description exchange once, caching the result
    /// for the lifetime of the session (spec §4.5).
    ///
    /// Requests a `DescribeReturn` for system information, then races a
    /// second `DescribeReturn` for application (function/variable) state
    /// against a synthetic resolver that fires immediately if the first
    /// response already carried both `f` and `v`.
    pub async fn describe(&self) -> Result<Introspection, SessionError> {
        if let Some(introspection) = self.introspection() {
            return Ok(introspection);
        }

        let token = self
            .send_message(MessageName::Describe, WrapParams::None, Vec::new(), NONE_HOLDER)
            .await?;
        let first = self.listen_for_token("DescribeReturn", token).await?;
        let system_information: serde_json::Value = serde_json::from_slice(&first.payload)
            .map_err(|e| SessionError::Coap(CoapError::Codec(format!("describe payload: {e}"))))?;

        let mut function_state = if system_information.get("f").is_some()
            && system_information.get("v").is_some()
        {
            self.release_token(token);
            system_information.clone()
        } else {
            let second = self.listen_for_token("DescribeReturn", token).await?;
            self.release_token(token);
            serde_json::from_slice(&second.payload)
                .map_err(|e| SessionError::Coap(CoapError::Codec(format!("describe payload: {e}"))))?
        };

        if let Some(variables) = function_state.get_mut("v").and_then(|v| v.as_object_mut()) {
            coap::translate_int_types(variables);
        }

        let introspection = Introspection {
            system_information,
            function_state,
        };
        self.set_introspection(introspection.clone());
        Ok(introspection)
    }

    /// Reads a device variable by name, decoded per its introspected type
    /// (defaulting to `string` if the device omitted one).
    pub async fn get_variable(&self, name: &str) -> Result<DecodedValue, SessionError> {
        let introspection = self.ensure_introspection().await?;
        let variables = introspection
            .function_state
            .get("v")
            .and_then(|v| v.as_object())
            .ok_or(SessionError::NoDeviceState)?;
        let type_name = variables
            .get(name)
            .ok_or(SessionError::VariableNotFound)?
            .as_str()
            .unwrap_or("string")
            .to_string();

        let token = self
            .send_message(
                MessageName::VariableRequest,
                WrapParams::VariableName(name.to_string()),
                Vec::new(),
                NONE_HOLDER,
            )
            .await?;
        let response = self.listen_for_token("VariableValue", token).await?;
        coap::from_binary(&response.payload, &type_name).map_err(SessionError::from)
    }

    /// Calls a device function, returning its `int32` result.
    pub async fn call_function(&self, name: &str, args: Vec<String>) -> Result<i32, SessionError> {
        let introspection = self.ensure_introspection().await?;
        let spec = resolve_arg_spec(&introspection.function_state, name)
            .ok_or(SessionError::UnknownFunction)?;
        let args_query = coap::build_arguments(&args, &spec);

        let token = self
            .send_message(
                MessageName::FunctionCall,
                WrapParams::Function {
                    name: name.to_string(),
                    args_query,
                },
                Vec::new(),
                NONE_HOLDER,
            )
            .await?;
        let response = self.listen_for_token("FunctionReturn", token).await?;
        match coap::from_binary(&response.payload, "int32")? {
            DecodedValue::Int32(value) => Ok(value),
            _ => Err(SessionError::Coap(CoapError::Codec(
                "function return not int32".into(),
            ))),
        }
    }

    /// Toggles the device's "nyan" signal mode on or off.
    pub async fn raise_signal(&self, on: bool) -> Result<(), SessionError> {
        let token = self
            .send_message(MessageName::SignalStart, WrapParams::Signal { on }, Vec::new(), NONE_HOLDER)
            .await?;
        self.listen_for_token("SignalStartReturn", token).await?;
        Ok(())
    }

    /// Bridges an externally-published event back down to the device as a
    /// `PublicEvent`/`PrivateEvent` send (spec §4.5's `onCoreEvent`).
    pub async fn on_core_event(&self, event: CoreEvent) -> Result<(), SessionError> {
        let name = if event.is_public {
            MessageName::PublicEvent
        } else {
            MessageName::PrivateEvent
        };
        let payload = event.data.unwrap_or_default();
        self.send_message(
            name,
            WrapParams::Event {
                name: event.name,
                max_age: event.ttl,
                timestamp: event.published_at,
            },
            payload,
            NONE_HOLDER,
        )
        .await?;
        Ok(())
    }
}
