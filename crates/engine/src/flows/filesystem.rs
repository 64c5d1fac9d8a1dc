//! File collection flows

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::FILESYSTEM;
use crate::flow::{ClientResponse, Flow, FlowAction, FlowError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GetFileArgs {
    /// Absolute path of the file on the client
    #[serde(default)]
    pub path: String,
}

/// Stats a file on the client and transfers its contents
#[derive(Debug, Serialize, Deserialize)]
pub struct GetFile {
    args: GetFileArgs,
    #[serde(default)]
    stat: Option<Value>,
}

impl Flow for GetFile {
    const NAME: &'static str = "GetFile";
    const CATEGORY: &'static str = FILESYSTEM;
    const DOC: &'static str = "Retrieve a single file from the client.";
    type Args = GetFileArgs;

    fn validate_args(args: &Self::Args) -> Result<(), String> {
        if args.path.is_empty() {
            return Err("path must not be empty".to_string());
        }
        Ok(())
    }

    fn new(args: Self::Args) -> Self {
        Self { args, stat: None }
    }

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        Ok(vec![FlowAction::call_client(
            "StatFile",
            json!({ "path": self.args.path }),
            "Stat",
        )])
    }

    fn on_response(
        &mut self,
        state: &str,
        response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError> {
        match state {
            "Stat" => {
                if let Some(message) = response.error_message() {
                    return Ok(vec![FlowAction::log(format!(
                        "Stat of {} failed: {message}",
                        self.args.path
                    ))]);
                }
                let stat = response.payloads.into_iter().next().ok_or_else(|| {
                    FlowError::new(format!("StatFile returned nothing for {}", self.args.path))
                })?;
                let length = stat.get("st_size").and_then(Value::as_u64).unwrap_or(0);
                self.stat = Some(stat);

                Ok(vec![FlowAction::call_client(
                    "TransferBuffer",
                    json!({ "path": self.args.path, "offset": 0, "length": length }),
                    "ReadBuffer",
                )])
            }
            "ReadBuffer" => {
                if let Some(message) = response.error_message() {
                    return Err(FlowError::new(format!(
                        "transfer of {} failed: {message}",
                        self.args.path
                    )));
                }
                let stat = self.stat.take().unwrap_or_else(|| json!({ "path": self.args.path }));
                Ok(vec![
                    FlowAction::log(format!("Fetched {}", self.args.path)),
                    FlowAction::reply("StatEntry", stat),
                ])
            }
            other => Err(FlowError::unknown_state(Self::NAME, other)),
        }
    }
}

/// What [`FileFinder`] does with each matched file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileFinderAction {
    #[default]
    Stat,
    Download,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FileFinderArgs {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub action: FileFinderAction,
}

/// Stats or downloads a set of files
#[derive(Debug, Serialize, Deserialize)]
pub struct FileFinder {
    args: FileFinderArgs,
}

impl Flow for FileFinder {
    const NAME: &'static str = "FileFinder";
    const CATEGORY: &'static str = FILESYSTEM;
    const DOC: &'static str = "Find files on the client and stat or download them.";
    type Args = FileFinderArgs;

    fn validate_args(args: &Self::Args) -> Result<(), String> {
        if args.paths.is_empty() {
            return Err("at least one path is required".to_string());
        }
        if args.paths.iter().any(String::is_empty) {
            return Err("paths must not be empty".to_string());
        }
        Ok(())
    }

    fn new(args: Self::Args) -> Self {
        Self { args }
    }

    fn on_start(&mut self) -> Result<Vec<FlowAction>, FlowError> {
        Ok(self
            .args
            .paths
            .iter()
            .map(|path| match self.args.action {
                FileFinderAction::Stat => {
                    FlowAction::call_client("StatFile", json!({ "path": path }), "StatDone")
                }
                FileFinderAction::Download => {
                    FlowAction::call_flow("GetFile", json!({ "path": path }), "Downloaded")
                }
            })
            .collect())
    }

    fn on_response(
        &mut self,
        state: &str,
        response: ClientResponse,
    ) -> Result<Vec<FlowAction>, FlowError> {
        match state {
            "StatDone" | "Downloaded" => {
                if let Some(message) = response.error_message() {
                    return Ok(vec![FlowAction::log(format!("File not collected: {message}"))]);
                }
                Ok(response
                    .payloads
                    .into_iter()
                    .map(|stat| FlowAction::reply("FileFinderResult", json!({ "stat_entry": stat })))
                    .collect())
            }
            other => Err(FlowError::unknown_state(Self::NAME, other)),
        }
    }
}
