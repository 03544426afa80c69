//! `Sequence`: a list of operators applied left-to-right. The input list
//! threads through unchanged in size unless a member operator changes it.

use std::sync::Arc;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{NightlightError, Result};
use crate::promise::Promise;

use super::{to_tagged_json, Operator, Registry};

#[derive(Debug)]
pub struct Sequence {
    steps: Vec<Box<dyn Operator>>,
}

impl Sequence {
    pub fn new(steps: Vec<Box<dyn Operator>>) -> Self {
        Sequence { steps }
    }

    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let registry = Registry::with_builtins();
        let steps_json = value
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| NightlightError::Configuration("\"seq\" operator is missing a \"steps\" array".into()))?;
        let mut steps = Vec::with_capacity(steps_json.len());
        for step in steps_json {
            steps.push(registry.create(step)?);
        }
        Ok(Box::new(Sequence { steps }))
    }
}

impl Operator for Sequence {
    fn type_tag(&self) -> &'static str {
        "seq"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let mut current = ins;
        for op in &self.steps {
            current = op.make_promises(current, ctx)?;
        }
        Ok(current)
    }

    fn to_json(&self) -> Result<Value> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for op in &self.steps {
            steps.push(op.to_json()?);
        }
        to_tagged_json("seq", serde_json::json!({ "steps": steps }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::operator::unary::ScaleOffset;
    use crate::image::Image;

    #[test]
    fn sequence_applies_steps_left_to_right() {
        let ctx = Arc::new(ExecutionContext::new(ContextParams::default()));
        let seq = Sequence::new(vec![
            Box::new(ScaleOffset { a: 2.0, b: 0.0 }),
            Box::new(ScaleOffset { a: 1.0, b: 3.0 }),
        ]);
        let ins = vec![Promise::ready(Some(Image::new(0, vec![1, 1], vec![1.0])))];
        let outs = seq.make_promises(ins, &ctx).unwrap();
        let (results, err) = crate::promise::materialize_all(outs, 1, false);
        assert!(err.is_none());
        assert_eq!(results[0].as_ref().unwrap().data, vec![5.0]);
    }

    #[test]
    fn sequence_round_trips_through_json() {
        let registry = Registry::with_builtins();
        let json = serde_json::json!({
            "type": "seq",
            "steps": [
                {"type": "scaleOffset", "a": 2.0, "b": 1.0},
                {"type": "scaleOffset", "a": 1.0, "b": 0.0},
            ]
        });
        let op = registry.create(&json).unwrap();
        let round_tripped = op.to_json().unwrap();
        assert_eq!(round_tripped["steps"].as_array().unwrap().len(), 2);
    }
}
