//! Convergence: probe, diff, apply.

mod diff;
mod engine;
mod render;

pub use diff::{Action, NodePlan, Stage, check_downgrade, plan_node};
pub use engine::{ConvergeEngine, ConvergeOptions};
pub use render::{CONTAINER_DATA_DIR, config_diff, render_config};
