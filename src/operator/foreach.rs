//! `ForEach`: lifts a single operator to act on each input independently.

use std::sync::Arc;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{NightlightError, Result};
use crate::promise::Promise;

use super::{to_tagged_json, Operator, Registry};

#[derive(Debug)]
pub struct ForEach {
    inner: Box<dyn Operator>,
}

impl ForEach {
    pub fn new(inner: Box<dyn Operator>) -> Self {
        ForEach { inner }
    }

    pub fn from_json(value: Value) -> Result<Box<dyn Operator>> {
        let registry = Registry::with_builtins();
        let op_json = value
            .get("op")
            .ok_or_else(|| NightlightError::Configuration("\"forEach\" operator is missing an \"op\" field".into()))?;
        let inner = registry.create(op_json)?;
        Ok(Box::new(ForEach { inner }))
    }
}

impl Operator for ForEach {
    fn type_tag(&self) -> &'static str {
        "forEach"
    }

    fn make_promises(&self, ins: Vec<Promise>, ctx: &Arc<ExecutionContext>) -> Result<Vec<Promise>> {
        let mut outs = Vec::with_capacity(ins.len());
        for input in ins {
            let mut produced = self.inner.make_promises(vec![input], ctx)?;
            outs.append(&mut produced);
        }
        Ok(outs)
    }

    fn to_json(&self) -> Result<Value> {
        to_tagged_json("forEach", serde_json::json!({ "op": self.inner.to_json()? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::image::Image;
    use crate::operator::unary::ScaleOffset;

    #[test]
    fn for_each_applies_inner_op_to_every_input() {
        let ctx = Arc::new(ExecutionContext::new(ContextParams::default()));
        let op = ForEach::new(Box::new(ScaleOffset { a: 1.0, b: 10.0 }));
        let ins = vec![
            Promise::ready(Some(Image::new(0, vec![1, 1], vec![1.0]))),
            Promise::ready(Some(Image::new(1, vec![1, 1], vec![2.0]))),
        ];
        let outs = op.make_promises(ins, &ctx).unwrap();
        let (results, err) = crate::promise::materialize_all(outs, 2, false);
        assert!(err.is_none());
        let vals: Vec<f32> = results.into_iter().map(|i| i.unwrap().data[0]).collect();
        assert_eq!(vals, vec![11.0, 12.0]);
    }
}
