use alloy::primitives::{Address, B256, U256};
use thiserror::Error;

use crate::error::AppError;
use crate::models::{CallTraceNode, TokenRecord};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("trace node {index} is missing `{field}`")]
    MalformedNode { index: u32, field: &'static str },
    #[error("trace has more than {} nodes", u32::MAX)]
    TooManyNodes,
}

impl From<TraceError> for AppError {
    fn from(err: TraceError) -> Self {
        AppError::DecodeError(err.to_string())
    }
}

/// Fields shared by every record produced from one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub coin_id: u64,
    pub block_number: u64,
    pub timestamp: u64,
    pub tx_hash: B256,
}

impl TraceContext {
    fn record(&self, event_index: u32, from: Address, to: Address, value: U256) -> TokenRecord {
        TokenRecord {
            coin_id: self.coin_id,
            block_number: self.block_number,
            timestamp: self.timestamp,
            tx_hash: self.tx_hash,
            event_index,
            from,
            to,
            value,
        }
    }
}

/// Flatten a call tree into value-transfer records, in pre-order.
///
/// Every node is visited once. A node yields a record when it is a `CALL` carrying a positive
/// value, and its `event_index` is the node's pre-order position (the root is 0). Any node
/// without `from`, `to` or `type` rejects the whole trace.
pub fn flatten_trace(root: &CallTraceNode, ctx: &TraceContext) -> Result<Vec<TokenRecord>, TraceError> {
    let mut records = Vec::new();
    let mut stack = vec![root];
    let mut index: u32 = 0;

    while let Some(node) = stack.pop() {
        let from = node.from.ok_or(TraceError::MalformedNode { index, field: "from" })?;
        let to = node.to.ok_or(TraceError::MalformedNode { index, field: "to" })?;
        if node.call_type.is_none() {
            return Err(TraceError::MalformedNode { index, field: "type" });
        }

        if node.is_value_call() {
            let value = node.value.unwrap_or_default();
            records.push(ctx.record(index, from, to, value));
        }

        stack.extend(node.calls.iter().rev());
        index = index.checked_add(1).ok_or(TraceError::TooManyNodes)?;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TraceContext {
        TraceContext {
            coin_id: 5567,
            block_number: 1_000,
            timestamp: 1_600_000_000,
            tx_hash: B256::repeat_byte(0xab),
        }
    }

    fn node(call_type: &str, from: u8, to: u8, value: u64, calls: Vec<CallTraceNode>) -> CallTraceNode {
        CallTraceNode {
            from: Some(Address::repeat_byte(from)),
            to: Some(Address::repeat_byte(to)),
            call_type: Some(call_type.to_string()),
            value: (value > 0).then(|| U256::from(value)),
            error: None,
            calls,
        }
    }

    #[test]
    fn test_flatten_preorder_with_indices() {
        // 0 CALL(5) -> [1 DELEGATECALL -> [2 CALL(7)], 3 CALL(0), 4 CALL(9)]
        let tree = node("CALL", 1, 2, 5, vec![
            node("DELEGATECALL", 2, 3, 0, vec![node("CALL", 3, 4, 7, vec![])]),
            node("CALL", 2, 5, 0, vec![]),
            node("CALL", 2, 6, 9, vec![]),
        ]);

        let records = flatten_trace(&tree, &ctx()).unwrap();
        let summary: Vec<(u32, u8, u64)> = records
            .iter()
            .map(|r| (r.event_index, r.to.0[0], r.value.to::<u64>()))
            .collect();
        assert_eq!(summary, vec![(0, 2, 5), (2, 4, 7), (4, 6, 9)]);
        assert!(records.iter().all(|r| r.tx_hash == ctx().tx_hash && r.block_number == 1_000));
    }

    #[test]
    fn test_non_call_value_is_ignored() {
        let tree = node("CREATE", 1, 2, 100, vec![node("STATICCALL", 2, 3, 0, vec![])]);
        assert!(flatten_trace(&tree, &ctx()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_child_rejects_trace() {
        let mut child = node("CALL", 2, 3, 1, vec![]);
        child.to = None;
        let tree = node("CALL", 1, 2, 5, vec![node("CALL", 2, 4, 1, vec![]), child]);

        assert_eq!(
            flatten_trace(&tree, &ctx()),
            Err(TraceError::MalformedNode { index: 2, field: "to" })
        );
    }

    #[test]
    fn test_missing_type_rejects_trace() {
        let mut tree = node("CALL", 1, 2, 5, vec![]);
        tree.call_type = None;
        assert!(matches!(
            flatten_trace(&tree, &ctx()),
            Err(TraceError::MalformedNode { field: "type", .. })
        ));
    }

    #[test]
    fn test_deep_tree_does_not_overflow() {
        let mut tree = node("CALL", 1, 2, 1, vec![]);
        for _ in 0..2_000 {
            tree = node("CALL", 1, 2, 1, vec![tree]);
        }
        let records = flatten_trace(&tree, &ctx()).unwrap();
        assert_eq!(records.len(), 2_001);
        assert_eq!(records.last().map(|r| r.event_index), Some(2_000));
    }
}
