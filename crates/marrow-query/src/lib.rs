mod filter;
mod parse;
mod pipeline;
mod sort;

pub use filter::Filter;
pub use parse::{json_to_value, parse_filter, parse_sort};
pub use pipeline::{
    AggSpec, GroupSpec, PipelineResult, Stage, execute, execute_cancellable, parse_pipeline,
    run_pipeline, run_pipeline_cancellable,
};
pub use sort::{SortDirection, SortKey, apply_sort};
