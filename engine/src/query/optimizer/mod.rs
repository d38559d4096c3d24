//! AST-to-AST optimizer.
//!
//! Runs the enabled rewrite passes in a fixed order until a round changes
//! nothing or `max_iterations` rounds have run. Every pass preserves the
//! result rows; only their order may differ where the query does not sort.

mod cost;
mod passes;

pub use cost::{Cost, CostModel};

use crate::config::OptimizerConfig;
use crate::query::ast::Query;
use crate::schema::SchemaProvider;
use passes::Rewrite;
use serde::Serialize;
use tracing::debug;

/// A rewrite pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    /// Evaluates literal-only sub-expressions.
    ConstantFolding,
    /// Moves filters toward the source.
    PredicatePushdown,
    /// Drops columns the rest of the pipeline never reads.
    ProjectionPushdown,
    /// Removes stages without observable effect.
    DeadOperationElimination,
    /// Orders adjacent filters by estimated cost.
    StageReordering,
}

impl Pass {
    /// All passes, in the order they run.
    pub const ALL: [Self; 5] = [
        Self::ConstantFolding,
        Self::PredicatePushdown,
        Self::ProjectionPushdown,
        Self::DeadOperationElimination,
        Self::StageReordering,
    ];

    const fn enabled(self, config: &OptimizerConfig) -> bool {
        match self {
            Self::ConstantFolding => config.constant_folding,
            Self::PredicatePushdown => config.predicate_pushdown,
            Self::ProjectionPushdown => config.projection_pushdown,
            Self::DeadOperationElimination => config.dead_operation_elimination,
            Self::StageReordering => config.stage_reordering,
        }
    }
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConstantFolding => "constant_folding",
            Self::PredicatePushdown => "predicate_pushdown",
            Self::ProjectionPushdown => "projection_pushdown",
            Self::DeadOperationElimination => "dead_operation_elimination",
            Self::StageReordering => "stage_reordering",
        };
        write!(f, "{name}")
    }
}

/// How many rewrites a pass made over the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// The pass.
    pub pass: Pass,
    /// Number of rewrites applied, summed over all rounds.
    pub applied: usize,
}

/// Rewrites queries into cheaper equivalents.
///
/// # Example
///
/// ```
/// use engine::query::{parse_query, Optimizer};
/// use engine::schema::InMemorySchemaProvider;
///
/// let schema = InMemorySchemaProvider::new();
/// let optimizer = Optimizer::new(&schema);
/// let query = parse_query("T | where 1 + 1 == 2 and x > 3").unwrap();
/// assert_eq!(optimizer.optimize(&query).to_string(), "T | where x > 3");
/// ```
pub struct Optimizer<'a> {
    schema: &'a dyn SchemaProvider,
    config: OptimizerConfig,
    cost: CostModel,
}

impl<'a> Optimizer<'a> {
    /// Creates an optimizer with every pass enabled and default costs.
    #[must_use]
    pub fn new(schema: &'a dyn SchemaProvider) -> Self {
        Self {
            schema,
            config: OptimizerConfig::default(),
            cost: CostModel::default(),
        }
    }

    /// Replaces the pass toggles and iteration bound.
    #[must_use]
    pub fn with_config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the cost constants.
    #[must_use]
    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    /// The cost model in use.
    #[must_use]
    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    /// Estimates the cost of a query.
    #[must_use]
    pub fn estimate(&self, query: &Query) -> Cost {
        self.cost.estimate(query, self.schema)
    }

    /// Returns the optimized query. The input is left untouched.
    #[must_use]
    pub fn optimize(&self, query: &Query) -> Query {
        self.optimize_with_report(query).0
    }

    /// Returns the optimized query and how often each enabled pass fired.
    #[must_use]
    pub fn optimize_with_report(&self, query: &Query) -> (Query, Vec<PassReport>) {
        let passes: Vec<Pass> = Pass::ALL
            .into_iter()
            .filter(|p| p.enabled(&self.config))
            .collect();
        let mut reports: Vec<PassReport> = passes
            .iter()
            .map(|&pass| PassReport { pass, applied: 0 })
            .collect();

        let mut current = query.clone();
        for round in 1..=self.config.max_iterations {
            let mut changed = false;
            for report in &mut reports {
                let rewrite = self.run(report.pass, &current);
                if rewrite.applied > 0 && rewrite.query != current {
                    report.applied += rewrite.applied;
                    current = rewrite.query;
                    changed = true;
                }
            }
            if !changed {
                debug!(rounds = round, "optimizer reached fixpoint");
                break;
            }
        }
        (current, reports)
    }

    fn run(&self, pass: Pass, query: &Query) -> Rewrite {
        match pass {
            Pass::ConstantFolding => passes::constant_folding(query),
            Pass::PredicatePushdown => passes::predicate_pushdown(query, self.schema),
            Pass::ProjectionPushdown => passes::projection_pushdown(query, self.schema),
            Pass::DeadOperationElimination => {
                passes::dead_operation_elimination(query, self.schema)
            }
            Pass::StageReordering => passes::stage_reordering(query, &self.cost),
        }
    }
}

/// Optimizes with default settings.
#[must_use]
pub fn optimize(query: &Query, schema: &dyn SchemaProvider) -> Query {
    Optimizer::new(schema).optimize(query)
}
