use super::{Model, Operation};

use std::collections::BTreeMap;

/// A key/value operation kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KvOp {
    Get,
    Put,
    Append,
}

/// The input of a key/value operation.
#[derive(Clone, Debug, PartialEq)]
pub struct KvInput {
    pub op: KvOp,
    pub key: String,
    pub value: String,
}

/// The output of a key/value operation. Only gets return a value; for
/// mutations it is empty.
#[derive(Clone, Debug, PartialEq)]
pub struct KvOutput {
    pub value: String,
}

/// The sequential model of the key/value store. Operations are partitioned
/// by key, so the state is a single key's value: a string register that
/// gets read, replaced, and appended to. Missing keys read as the empty
/// string.
pub struct KvModel;

impl Model for KvModel {
    type Input = KvInput;
    type Output = KvOutput;
    type State = String;

    fn partition(
        &self,
        history: Vec<Operation<KvInput, KvOutput>>,
    ) -> Vec<Vec<Operation<KvInput, KvOutput>>> {
        let mut by_key = BTreeMap::<String, Vec<_>>::new();
        for op in history {
            by_key.entry(op.input.key.clone()).or_default().push(op);
        }
        by_key.into_values().collect()
    }

    fn init(&self) -> String {
        String::new()
    }

    fn step(&self, state: &String, input: &KvInput, output: &KvOutput) -> Option<String> {
        match input.op {
            KvOp::Get => (output.value == *state).then(|| state.clone()),
            KvOp::Put => Some(input.value.clone()),
            KvOp::Append => Some(format!("{state}{}", input.value)),
        }
    }
}
