//! Informational JSON rendering of a plan tree.
//!
//! The shape is stable for tooling: `{ id, nodeType, description?,
//! logical?, physical?, children?, relations? }`. Execution never reads
//! this; it depends solely on the emitted instruction graph.

use crate::node::PlanNode;
use serde_json::{json, Value};

pub fn plan_to_json(root: &PlanNode) -> Value {
    let mut next_id = 0u32;
    render(root, &mut next_id)
}

fn render(node: &PlanNode, next_id: &mut u32) -> Value {
    let id = *next_id;
    *next_id += 1;
    let mut obj = json!({
        "id": id,
        "nodeType": node.node_type(),
        "description": node.label(),
    });
    let relations = node.relations();
    if !relations.is_empty() {
        obj["relations"] = json!(relations);
    }
    if let Some(descriptor) = node.descriptor() {
        obj["logical"] = json!({
            "descriptor": descriptor.id.0,
            "attributes": descriptor.attrs.iter().map(|a| a.0).collect::<Vec<_>>(),
        });
    }
    let children: Vec<Value> = node.children().into_iter().map(|c| render(c, next_id)).collect();
    if !children.is_empty() {
        obj["children"] = Value::Array(children);
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::RowDescriptor;
    use crate::expr::{BinaryOp, Expr};
    use crate::node::{ScanOrderHint, TableRef};
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_ids_depth_first() {
        let scan = PlanNode::TableScan {
            table: TableRef::new("main", "t"),
            descriptor: RowDescriptor::new(1, [10, 11]),
            constraints: vec![],
            order_hint: vec![ScanOrderHint { column: 0, desc: false }],
            with_rowid: None,
        };
        let plan = PlanNode::Filter {
            input: Box::new(scan),
            predicate: Expr::binary(BinaryOp::Gt, Expr::column(10), Expr::literal(1i64)),
        };
        let v = plan_to_json(&plan);
        assert_eq!(v["id"], 0);
        assert_eq!(v["nodeType"], "Filter");
        assert_eq!(v["children"][0]["id"], 1);
        assert_eq!(v["children"][0]["nodeType"], "TableScan");
        assert_eq!(v["children"][0]["relations"][0], "t");
        assert_eq!(v["children"][0]["logical"]["attributes"], json!([10, 11]));
    }
}
