use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// One frame of a `callTracer` result. Fields beyond these (gas, input, output) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallTraceNode {
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallTraceNode>,
}

impl CallTraceNode {
    pub const CALL: &'static str = "CALL";

    pub fn is_value_call(&self) -> bool {
        self.call_type.as_deref() == Some(Self::CALL)
            && self.value.map_or(false, |value| !value.is_zero())
    }

    /// Total number of frames in this subtree, the node included
    pub fn node_count(&self) -> usize {
        1 + self.calls.iter().map(CallTraceNode::node_count).sum::<usize>()
    }
}
