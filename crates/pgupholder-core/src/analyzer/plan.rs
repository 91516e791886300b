//! EXPLAIN (FORMAT JSON) plan parsing.
//!
//! Only plain EXPLAIN output is ever parsed; the analyzer never runs
//! EXPLAIN ANALYZE, so no Actual* fields are expected.

use serde::Serialize;
use serde_json::Value;

/// Flattened view of one query plan tree.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Plan {
    pub total_cost: f64,
    pub startup_cost: f64,
    pub est_rows: f64,
    pub node_types: Vec<String>,
    pub relations: Vec<String>,
    pub has_seq_scan: bool,
    pub has_sort: bool,
    pub has_hash_join: bool,
    pub has_nested_loop: bool,
    pub depth: usize,
}

/// Parse the JSON value returned by `EXPLAIN (FORMAT JSON)`.
///
/// The server returns a one-element array whose entry holds the root under
/// the "Plan" key. Returns None on any unexpected shape.
pub fn parse_explain(value: &Value) -> Option<Plan> {
    let root = value.as_array()?.first()?.get("Plan")?;

    let mut plan = Plan {
        total_cost: root.get("Total Cost").and_then(Value::as_f64).unwrap_or(0.0),
        startup_cost: root
            .get("Startup Cost")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        est_rows: root.get("Plan Rows").and_then(Value::as_f64).unwrap_or(0.0),
        ..Plan::default()
    };
    walk(root, 1, &mut plan);
    Some(plan)
}

fn walk(node: &Value, depth: usize, plan: &mut Plan) {
    plan.depth = plan.depth.max(depth);

    if let Some(node_type) = node.get("Node Type").and_then(Value::as_str) {
        match node_type {
            "Seq Scan" => plan.has_seq_scan = true,
            "Sort" | "Incremental Sort" => plan.has_sort = true,
            "Hash Join" => plan.has_hash_join = true,
            "Nested Loop" => plan.has_nested_loop = true,
            _ => {}
        }
        if !plan.node_types.iter().any(|t| t == node_type) {
            plan.node_types.push(node_type.to_string());
        }
    }

    if let Some(relation) = node.get("Relation Name").and_then(Value::as_str) {
        let relation = relation.to_lowercase();
        if !plan.relations.contains(&relation) {
            plan.relations.push(relation);
        }
    }

    if let Some(children) = node.get("Plans").and_then(Value::as_array) {
        for child in children {
            walk(child, depth + 1, plan);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_scan_with_sort() -> Value {
        serde_json::json!([
            {
                "Plan": {
                    "Node Type": "Sort",
                    "Startup Cost": 120.5,
                    "Total Cost": 130.75,
                    "Plan Rows": 5000,
                    "Plan Width": 64,
                    "Sort Key": ["orders.created_at"],
                    "Plans": [
                        {
                            "Node Type": "Seq Scan",
                            "Relation Name": "orders",
                            "Startup Cost": 0.0,
                            "Total Cost": 95.0,
                            "Plan Rows": 5000,
                            "Plan Width": 64,
                            "Filter": "(status = 'paid'::text)"
                        }
                    ]
                }
            }
        ])
    }

    fn hash_join_three_levels() -> Value {
        serde_json::json!([
            {
                "Plan": {
                    "Node Type": "Hash Join",
                    "Total Cost": 900.0,
                    "Startup Cost": 20.0,
                    "Plan Rows": 1200,
                    "Plans": [
                        {
                            "Node Type": "Index Scan",
                            "Relation Name": "customers",
                            "Index Name": "customers_pkey",
                            "Total Cost": 400.0
                        },
                        {
                            "Node Type": "Hash",
                            "Total Cost": 450.0,
                            "Plans": [
                                {
                                    "Node Type": "Seq Scan",
                                    "Relation Name": "orders",
                                    "Total Cost": 440.0
                                }
                            ]
                        }
                    ]
                }
            }
        ])
    }

    #[test]
    fn parses_costs_rows_and_flags() {
        let plan = parse_explain(&seq_scan_with_sort()).unwrap();
        assert!((plan.total_cost - 130.75).abs() < f64::EPSILON);
        assert!((plan.startup_cost - 120.5).abs() < f64::EPSILON);
        assert!((plan.est_rows - 5000.0).abs() < f64::EPSILON);
        assert!(plan.has_seq_scan);
        assert!(plan.has_sort);
        assert!(!plan.has_hash_join);
        assert_eq!(plan.depth, 2);
        assert_eq!(plan.node_types, vec!["Sort", "Seq Scan"]);
        assert_eq!(plan.relations, vec!["orders"]);
    }

    #[test]
    fn collects_relations_across_join_branches() {
        let plan = parse_explain(&hash_join_three_levels()).unwrap();
        assert!(plan.has_hash_join);
        assert!(plan.has_seq_scan);
        assert_eq!(plan.depth, 3);
        assert_eq!(plan.relations, vec!["customers", "orders"]);
    }

    #[test]
    fn rejects_unexpected_shapes() {
        assert!(parse_explain(&serde_json::json!({})).is_none());
        assert!(parse_explain(&serde_json::json!([])).is_none());
        assert!(parse_explain(&serde_json::json!([{"NoPlan": {}}])).is_none());
    }
}
