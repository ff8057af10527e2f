//! Concrete scanner plugins and the shared subprocess/SARIF-splitting helpers
//! they're built from.

pub mod dependency_confusion;
pub mod semgrep;
pub mod trufflehog;

use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use uuid::Uuid;

/// Run a subprocess to completion within `timeout_secs`, capturing stdout as
/// a string. Mirrors `run_command`'s check=True-and-capture behavior: a
/// non-zero exit becomes an error carrying stdout/stderr.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout_secs: u64,
) -> io::Result<String> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let output = match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{program} timed out after {timeout_secs}s"),
            ))
        }
    };

    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{program} exited with {}\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that `program` is on `PATH` by attempting to spawn it, treating a
/// `NotFound` spawn error as "not installed" and anything else as present
/// (the process may exit non-zero for an unrecognized flag, which still
/// proves the binary exists).
pub async fn ensure_installed(program: &str) -> io::Result<()> {
    match tokio::process::Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(io::Error::new(io::ErrorKind::NotFound, format!("{program} is not installed")))
        }
        Err(e) => Err(e),
    }
}

/// Write a SARIF value to a uniquely-named temp file and return its path.
pub async fn write_sarif_to_temp(dir: &Path, doc: &Value) -> io::Result<PathBuf> {
    let path = dir.join(format!(".sarif-{}.json", Uuid::new_v4()));
    let mut f = tokio::fs::File::create(&path).await?;
    f.write_all(serde_json::to_string(doc)?.as_bytes()).await?;
    Ok(path)
}

/// Split a single-run SARIF document into one document per `ruleId`, each
/// carrying only that rule's results but the same driver/tool metadata.
/// Results lacking a `ruleId` are grouped under `unknown-rule`.
pub async fn split_sarif_by_rules(dir: &Path, sarif: &Value) -> io::Result<Option<HashMap<String, PathBuf>>> {
    let mut empty = sarif.clone();
    if let Some(results) = empty["runs"][0].get_mut("results") {
        *results = Value::Array(vec![]);
    }

    let mut grouped: HashMap<String, Value> = HashMap::new();
    if let Some(results) = sarif["runs"][0]["results"].as_array() {
        for result in results {
            let rule_id = result
                .get("ruleId")
                .and_then(Value::as_str)
                .unwrap_or("unknown-rule")
                .to_string();
            let entry = grouped.entry(rule_id).or_insert_with(|| empty.clone());
            entry["runs"][0]["results"]
                .as_array_mut()
                .expect("results is an array")
                .push(result.clone());
        }
    }

    if grouped.is_empty() {
        return Ok(None);
    }

    let mut out = HashMap::new();
    for (rule_id, doc) in grouped {
        out.insert(rule_id, write_sarif_to_temp(dir, &doc).await?);
    }
    Ok(Some(out))
}
