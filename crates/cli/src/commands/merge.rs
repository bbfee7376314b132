use clap::Args;
use loomweave_variables::{ArrayStrategy, MergeOperation, MergeOptions, MergeRequest};

use super::{CmdResult, parse_name, print_json, read_json};

#[derive(Debug, Args)]
pub struct MergeArgs {
    /// Base document: inline JSON or @file
    pub base: String,

    /// Overrides: inline JSON or @file
    pub overrides: String,

    /// replace | shallow_merge | merge | append | union
    #[arg(short, long, default_value = "merge", value_parser = parse_name::<MergeOperation>)]
    pub operation: MergeOperation,

    /// replace | concat | prepend | union | union_by_key
    #[arg(long, default_value = "replace", value_parser = parse_name::<ArrayStrategy>)]
    pub array_strategy: ArrayStrategy,

    /// Key path compared by union_by_key
    #[arg(long)]
    pub array_key: Option<String>,

    /// Path removed after merging (repeatable)
    #[arg(long = "remove")]
    pub remove_paths: Vec<String>,
}

impl MergeArgs {
    fn into_request(self) -> CmdResult<MergeRequest> {
        Ok(MergeRequest {
            base: read_json(&self.base)?,
            overrides: read_json(&self.overrides)?,
            operation: self.operation,
            options: MergeOptions {
                array_strategy: self.array_strategy,
                array_key: self.array_key,
                remove_paths: self.remove_paths,
            },
        })
    }
}

pub fn run(args: MergeArgs) -> CmdResult {
    let response = args.into_request()?.execute();
    print_json(&response.result)
}
