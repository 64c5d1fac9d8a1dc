//! Process listing

use std::collections::BTreeSet;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Process, PROCESSES};
use crate::flow::{ClientResponse, Flow, FlowAction, FlowError};

fn default_filename_regex() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListProcessesArgs {
    /// Regex matched against each process's executable path (or its name
    /// when the path is unknown)
    #[serde(default = "default_filename_regex")]
    pub filename_regex: String,

    /// Download the executable of every matching process
    #[serde(default)]
    pub fetch_binaries: bool,
}

impl Default for ListProcessesArgs {
    fn default() -> Self {
        Self {
            filename_regex: default_filename_regex(),
            fetch_binaries: false,
        }
    }
}

/// Lists processes running on the client
#[derive(Debug, Serialize, Deserialize)]
pub struct ListProcesses {
    args: ListProcessesArgs,
    #[serde(default)]
    requested_binaries: BTreeSet<String>,
}

impl Flow for ListProcesses {
    const NAME: &'static str = "ListProcesses";
    const CATEGORY: &'static str = PROCESSES;
    const DOC: &'static str = "List running processes on a system.";
    type Args = ListProcessesArgs;

    fn validate_args(args: &Self::Args) -> Result<(), String> {
        Regex::new(&args.filename_regex)
            .map(|_| ())
            .map_err(|e| format!("invalid filename_regex: {e}"))
    }

    fn new(args: Self::Args) -> Self {
        Self {
            args,
            requested_binaries: BTreeSet::new(),
        }
    }

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        Ok(vec![FlowAction::call_client(
            "ListProcesses",
            json!({}),
            "IterateProcesses",
        )])
    }

    fn on_response(
        &mut self,
        state: &str,
        response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError> {
        match state {
            "IterateProcesses" => self.iterate_processes(response),
            "HandleDownloadedFiles" => Ok(self.handle_downloaded_files(response)),
            other => Err(FlowError::unknown_state(Self::NAME, other)),
        }
    }
}

impl ListProcesses {
    fn iterate_processes(&mut self, response: ClientResponse) -> Result<Vec<FlowAction>, FlowError> {
        if let Some(message) = response.error_message() {
            return Err(FlowError::new(format!("ListProcesses failed: {message}")));
        }

        let filter = Regex::new(&self.args.filename_regex)
            .map_err(|e| FlowError::new(format!("invalid filename_regex: {e}")))?;

        let mut actions = vec![];
        let mut skipped = 0;
        for payload in response.payloads {
            let process: Process = serde_json::from_value(payload.clone())
                .map_err(|e| FlowError::new(format!("malformed process entry: {e}")))?;

            let subject = if process.exe.is_empty() {
                &process.name
            } else {
                &process.exe
            };
            if !filter.is_match(subject) {
                skipped += 1;
                continue;
            }

            if self.args.fetch_binaries
                && !process.exe.is_empty()
                && self.requested_binaries.insert(process.exe.clone())
            {
                actions.push(FlowAction::call_flow(
                    "GetFile",
                    json!({ "path": process.exe }),
                    "HandleDownloadedFiles",
                ));
            }
            actions.push(FlowAction::reply("Process", payload));
        }

        if skipped > 0 {
            actions.push(FlowAction::log(format!(
                "Skipped {skipped} processes not matching {}",
                self.args.filename_regex
            )));
        }
        Ok(actions)
    }

    fn handle_downloaded_files(&mut self, response: ClientResponse) -> Vec<FlowAction> {
        if let Some(message) = response.error_message() {
            return vec![FlowAction::log(format!("Download failed: {message}"))];
        }
        response
            .payloads
            .into_iter()
            .map(|stat| FlowAction::reply("StatEntry", stat))
            .collect()
    }
}
