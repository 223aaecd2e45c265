//! Recording fake of the blocking façade

use crate::rpc::testing::RecordedCall;
use crate::studio::blocking::ControlPlane;
use crate::studio::client::{
    ClientError, RenderFrameParams, SetDocumentParams, SetUniformParams, SwitchViewParams, methods,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<RecordedCall>,
    responses: HashMap<String, Value>,
    errors: HashMap<String, ClientError>,
}

/// `ControlPlane` that records every call and answers from canned values.
///
/// Parameters are recorded in their wire form. Methods without a canned
/// response return `null`.
#[derive(Debug, Default)]
pub struct RecordingControlPlane {
    state: Mutex<RecordingState>,
}

impl RecordingControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, method: &str, result: Value) -> Self {
        self.set_response(method, result);
        self
    }

    pub fn set_response(&self, method: &str, result: Value) {
        self.state.lock().responses.insert(method.to_string(), result);
    }

    pub fn set_error(&self, method: &str, error: ClientError) {
        self.state.lock().errors.insert(method.to_string(), error);
    }

    pub fn clear_error(&self, method: &str) {
        self.state.lock().errors.remove(method);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.state.lock().calls.last().cloned()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record<P: Serialize>(&self, method: &str, params: Option<&P>) -> Result<Value, ClientError> {
        let params = params
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ClientError::Encode {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        let mut state = self.state.lock();
        let sequence = state.calls.len() as u64;
        state.calls.push(RecordedCall {
            sequence,
            method: method.to_string(),
            params,
        });

        if let Some(error) = state.errors.get(method) {
            return Err(error.clone());
        }
        Ok(state.responses.get(method).cloned().unwrap_or(Value::Null))
    }
}

impl ControlPlane for RecordingControlPlane {
    fn ping(&self) -> Result<(), ClientError> {
        self.record::<Value>(methods::PING, None).map(|_| ())
    }

    fn set_document(&self, source: &str, path: Option<&str>) -> Result<Value, ClientError> {
        let params = SetDocumentParams {
            source: source.to_string(),
            path: path.map(str::to_string),
        };
        self.record(methods::SET_DOCUMENT, Some(&params))
    }

    fn render_frame(&self, time: f64, width: u32, height: u32) -> Result<Value, ClientError> {
        let params = RenderFrameParams {
            time,
            width,
            height,
        };
        self.record(methods::RENDER_FRAME, Some(&params))
    }

    fn switch_view(&self, view: &str) -> Result<Value, ClientError> {
        let params = SwitchViewParams {
            view: view.to_string(),
        };
        self.record(methods::SWITCH_VIEW, Some(&params))
    }

    fn set_uniform(&self, name: &str, value: Value) -> Result<Value, ClientError> {
        let params = SetUniformParams {
            name: name.to_string(),
            value,
        };
        self.record(methods::SET_UNIFORM, Some(&params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error::TransportError;
    use serde_json::json;

    /// Stand-in for UI code that only knows the blocking contract
    fn show_preview(control: &dyn ControlPlane) -> Result<Value, ClientError> {
        control.switch_view("preview")?;
        control.render_frame(0.0, 800, 600)
    }

    #[test]
    fn test_records_calls_in_wire_form() {
        let fake = RecordingControlPlane::new().with_response(methods::RENDER_FRAME, json!({"frame": 0}));

        assert_eq!(show_preview(&fake).unwrap(), json!({"frame": 0}));

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method, "switch_view");
        assert_eq!(calls[0].params, Some(json!({"view": "preview"})));
        assert_eq!(calls[1].sequence, 1);
        assert_eq!(
            calls[1].params,
            Some(json!({"time": 0.0, "width": 800, "height": 600}))
        );
    }

    #[test]
    fn test_injected_error_is_returned_and_recorded() {
        let fake = RecordingControlPlane::new();
        fake.set_error(methods::SWITCH_VIEW, ClientError::Transport(TransportError::Closed));

        assert!(show_preview(&fake).is_err());
        // The failing call is still recorded; render_frame never happened
        assert_eq!(fake.call_count(), 1);
        assert!(fake.calls_to(methods::RENDER_FRAME).is_empty());

        fake.clear_error(methods::SWITCH_VIEW);
        fake.clear_calls();
        assert!(show_preview(&fake).is_ok());
        assert_eq!(fake.call_count(), 2);
    }

    #[test]
    fn test_defaults_and_optional_fields() {
        let fake = RecordingControlPlane::new();
        fake.ping().unwrap();
        assert_eq!(fake.set_document("void main() {}", None).unwrap(), Value::Null);

        let last = fake.last_call().unwrap();
        assert_eq!(last.params, Some(json!({"source": "void main() {}"})));
        assert_eq!(fake.calls()[0].params, None);
    }
}
