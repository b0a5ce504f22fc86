//! Static depth and cost analysis of a lowered operation, run before any
//! resolver.

use std::collections::{BTreeSet, HashMap};

use unigraph_contracts::{GatewayError, ValidationBudget};

use crate::graphql::{FieldNode, OperationPlan};

const INTROSPECTION_LIST_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReport {
    pub depth: u32,
    pub cost: u64,
}

/// Each field costs one unit unless overridden by `"Type.field"`; list
/// fields multiply the cost of their selection.
#[derive(Debug, Clone)]
pub struct CostModel {
    list_factor: u64,
    overrides: HashMap<String, u64>,
}

impl CostModel {
    pub fn new(list_factor: u64) -> Self {
        Self {
            list_factor: list_factor.max(1),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, coordinate: &str, cost: u64) -> Self {
        self.overrides.insert(coordinate.to_string(), cost);
        self
    }

    pub fn cost(&self, fields: &[FieldNode]) -> u64 {
        fields.iter().fold(0u64, |acc, f| acc.saturating_add(self.field_cost(f)))
    }

    fn field_cost(&self, field: &FieldNode) -> u64 {
        let unit = self
            .overrides
            .get(&format!("{}.{}", field.parent_type, field.name))
            .copied()
            .unwrap_or(1);
        let factor = if !field.ty.is_list() {
            1
        } else if field.ty.named_type().starts_with("__") {
            INTROSPECTION_LIST_FACTOR
        } else {
            self.list_factor
        };
        unit.saturating_add(factor.saturating_mul(self.cost(&field.selection)))
    }
}

#[derive(Debug, Clone)]
pub struct ValidationChain {
    budget: ValidationBudget,
    cost_model: CostModel,
    depth_exempt: BTreeSet<String>,
}

impl ValidationChain {
    pub fn new(budget: ValidationBudget, cost_model: CostModel) -> Self {
        Self {
            budget,
            cost_model,
            depth_exempt: ["__schema", "__type"].into_iter().map(String::from).collect(),
        }
    }

    pub fn with_depth_exempt(mut self, field: &str) -> Self {
        self.depth_exempt.insert(field.to_string());
        self
    }

    pub fn budget(&self) -> ValidationBudget {
        self.budget
    }

    pub fn measure(&self, plan: &OperationPlan) -> ValidationReport {
        ValidationReport {
            depth: self.depth(&plan.fields, 0),
            cost: self.cost_model.cost(&plan.fields),
        }
    }

    /// Depth is checked before cost.
    pub fn enforce(&self, report: ValidationReport) -> Result<(), GatewayError> {
        if report.depth > self.budget.max_depth {
            return Err(GatewayError::DepthExceeded {
                limit: self.budget.max_depth,
                observed: report.depth,
            });
        }
        if report.cost > self.budget.max_cost {
            return Err(GatewayError::ComplexityExceeded {
                limit: self.budget.max_cost,
                observed: report.cost,
            });
        }
        Ok(())
    }

    /// Root fields sit at level 0; the result is the deepest level reached
    /// by a non-exempt field.
    fn depth(&self, fields: &[FieldNode], level: u32) -> u32 {
        fields
            .iter()
            .filter(|f| !f.name.starts_with("__") && !self.depth_exempt.contains(&f.name))
            .map(|f| level.max(self.depth(&f.selection, level + 1)))
            .max()
            .unwrap_or(0)
    }
}
