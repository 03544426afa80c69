//! The operator graph: a JSON-serializable, polymorphic DAG of image
//! transforms, evaluated as lazy promises.
//!
//! Every operator type registers a factory keyed by its type tag, so the
//! graph round-trips through JSON without reflection; a `Sequence`'s
//! children are decoded only once their own tag is known.

pub mod foreach;
pub mod load;
pub mod sequence;
pub mod stack_op;
pub mod unary;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{NightlightError, Result};
use crate::image::Image;
use crate::promise::Promise;

/// A node in the processing graph. `make_promises` transforms a list of
/// input promises into a list of output promises without materializing
/// them — the graph is built lazily, then run by a driver.
pub trait Operator: Send + Sync + std::fmt::Debug {
    fn type_tag(&self) -> &'static str;
    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>>;
    fn to_json(&self) -> Result<Value>;
}

pub type Factory = fn(Value) -> Result<Box<dyn Operator>>;

/// Factory registry keyed by JSON `"type"` tag.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<&'static str, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry containing every operator type this crate ships.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("seq", sequence::Sequence::from_json);
        r.register("forEach", foreach::ForEach::from_json);
        r.register("loadMany", load::LoadMany::from_json);
        r.register("scaleOffset", unary::ScaleOffset::from_json);
        r.register("calibrate", unary::Calibrate::from_json);
        r.register("neutralizeBackground", unary::NeutralizeBackground::from_json);
        r.register("matchHist", unary::MatchHist::from_json);
        r.register("align", unary::Align::from_json);
        r.register("save", unary::Save::from_json);
        r.register("stack", stack_op::Stack::from_json);
        r.register("selectReference", crate::reference::SelectReference::from_json);
        r.register("stackBatches", crate::batch::StackBatches::from_json);
        r
    }

    pub fn register(&mut self, tag: &'static str, factory: Factory) {
        self.factories.insert(tag, factory);
    }

    /// Decode one operator object. Unknown tags are a fatal unmarshal
    /// error naming the offending type and the raw JSON, per the external
    /// interfaces contract.
    pub fn create(&self, value: &Value) -> Result<Box<dyn Operator>> {
        let obj = value.as_object().ok_or_else(|| {
            NightlightError::Configuration(format!("operator must be a JSON object, got: {value}"))
        })?;
        let tag = obj.get("type").and_then(Value::as_str).ok_or_else(|| {
            NightlightError::Configuration(format!("operator object is missing a \"type\" field: {value}"))
        })?;
        let factory = self.factories.get(tag).ok_or_else(|| {
            NightlightError::Configuration(format!("unknown operator type \"{tag}\": {value}"))
        })?;
        let mut body = value.clone();
        body.as_object_mut().unwrap().remove("type");
        factory(body)
    }
}

/// Re-attach a `"type"` tag to a serialized operator body, completing the
/// round-trip `Registry::create` started by stripping it.
pub fn to_tagged_json(tag: &str, body: Value) -> Result<Value> {
    let mut obj = body.as_object().cloned().ok_or_else(|| {
        NightlightError::Configuration("operator serialized to a non-object JSON value".into())
    })?;
    obj.insert("type".to_string(), Value::String(tag.to_string()));
    Ok(Value::Object(obj))
}

/// Shared implementation of the "Unary operator" base: N inputs -> N
/// outputs, each output being `apply(materialize(in_i), ctx)`. A filtered
/// input (`None`) stays filtered without invoking `apply`.
pub fn unary_make_promises<F>(ins: Vec<Promise>, ctx: &Arc<ExecutionContext>, apply: F) -> Result<Vec<Promise>>
where
    F: Fn(Image, &Arc<ExecutionContext>) -> Result<Option<Image>> + Send + Sync + Clone + 'static,
{
    let ctx = Arc::clone(ctx);
    let out = ins
        .into_iter()
        .map(move |input| {
            let apply = apply.clone();
            let ctx = Arc::clone(&ctx);
            Promise::new(move || match input.materialize()? {
                Some(img) => apply(img, &ctx),
                None => Ok(None),
            })
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;

    #[test]
    fn unknown_operator_type_is_a_configuration_error() {
        let registry = Registry::with_builtins();
        let err = registry.create(&serde_json::json!({"type": "doesNotExist"})).unwrap_err();
        assert!(matches!(err, NightlightError::Configuration(_)));
        assert!(err.to_string().contains("doesNotExist"));
    }

    #[test]
    fn operator_missing_type_field_is_a_configuration_error() {
        let registry = Registry::with_builtins();
        let err = registry.create(&serde_json::json!({"a": 1})).unwrap_err();
        assert!(matches!(err, NightlightError::Configuration(_)));
    }

    #[test]
    fn scale_offset_round_trips_through_json() {
        let registry = Registry::with_builtins();
        let op = registry.create(&serde_json::json!({"type": "scaleOffset", "a": 2.0, "b": 1.0})).unwrap();
        let json = op.to_json().unwrap();
        assert_eq!(json["type"], "scaleOffset");
        assert_eq!(json["a"], 2.0);
        let op2 = registry.create(&json).unwrap();
        assert_eq!(op2.to_json().unwrap(), json);
    }

    #[test]
    fn unary_make_promises_passes_filtered_frames_through_unchanged() {
        let ctx = Arc::new(ExecutionContext::new(ContextParams::default()));
        let ins = vec![Promise::ready(None)];
        let outs = unary_make_promises(ins, &ctx, |img, _ctx| Ok(Some(img))).unwrap();
        let (results, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(err.is_none());
        assert!(results[0].is_none());
    }
}
