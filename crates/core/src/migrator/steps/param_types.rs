//! Serialization types for parameter operators.
//!
//! Parameter values used to be stored as JSON text. Their serialization type
//! is decided by the Python SDK, so the classification runs through it
//! instead of being re-implemented here. The helper reads
//! `{"op", "param_type", "param_val"}` on stdin and prints
//! `<type>\n<val>\n`.

use crate::database::Json;
use crate::migrator::StepContext;
use crate::sql_args;
use anyhow::{bail, Context};
use std::io::Write;
use std::process::{Command, Stdio};
use uuid::Uuid;

const HELPER: &str = r#"
import json
import sys

req = json.load(sys.stdin)
op, param_type, val = req["op"], req.get("param_type") or "", req["param_val"]
if op == "encode":
    parsed = json.loads(val)
    if isinstance(parsed, str):
        sys.stdout.write("string\n" + parsed + "\n")
    else:
        sys.stdout.write("json\n" + val + "\n")
elif op == "decode":
    if param_type == "string":
        sys.stdout.write("json\n" + json.dumps(val) + "\n")
    else:
        sys.stdout.write("json\n" + val + "\n")
else:
    sys.exit("unknown op: " + op)
"#;

/// Runs the helper, returning `(serialization_type, value)`.
pub(crate) fn run_helper(
    python: &str,
    op: &str,
    param_type: &str,
    param_val: &str,
) -> anyhow::Result<(String, String)> {
    let request = serde_json::json!({
        "op": op,
        "param_type": param_type,
        "param_val": param_val,
    });
    let mut child = Command::new(python)
        .arg("-c")
        .arg(HELPER)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start parameter helper {}", python))?;
    let mut stdin = child.stdin.take().context("Parameter helper has no stdin")?;
    // A helper that exits early is reported through its exit status below.
    if let Err(e) = stdin.write_all(request.to_string().as_bytes()) {
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
    }
    drop(stdin);
    let output = child.wait_with_output()?;
    if !output.status.success() {
        bail!(
            "Parameter helper exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    if !output.stderr.is_empty() {
        tracing::debug!(
            "Parameter helper stderr: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8(output.stdout).context("Parameter helper printed non-UTF-8")?;
    let (kind, rest) = stdout
        .split_once('\n')
        .with_context(|| format!("Malformed parameter helper output: {:?}", stdout))?;
    let value = rest.strip_suffix('\n').unwrap_or(rest);
    Ok((kind.trim().to_string(), value.to_string()))
}

/// Param operators as `(id, spec)` with the spec left untyped, so the step
/// does not depend on the current model.
fn param_operators(ctx: &StepContext<'_>) -> anyhow::Result<Vec<(Uuid, serde_json::Value)>> {
    let mut out = Vec::new();
    for row in ctx.db.query("SELECT id, spec FROM operator", &[])? {
        let spec: serde_json::Value = row.get("spec")?;
        if spec["type"] == "param" {
            out.push((row.get("id")?, spec));
        }
    }
    Ok(out)
}

fn save(ctx: &StepContext<'_>, id: Uuid, spec: &serde_json::Value) -> anyhow::Result<()> {
    ctx.db.execute(
        "UPDATE operator SET spec = $1 WHERE id = $2",
        &sql_args![Json(spec), id],
    )?;
    Ok(())
}

pub(super) fn encode(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    for (id, mut spec) in param_operators(ctx)? {
        let param = &mut spec["param"];
        if param.get("serialization_type").is_some_and(|t| !t.is_null()) {
            continue;
        }
        let legacy = param["val"]
            .as_str()
            .with_context(|| format!("Param operator {} has no value", id))?
            .to_string();
        let (kind, value) = run_helper(ctx.python, "encode", "", &legacy)
            .with_context(|| format!("Failed to classify param operator {}", id))?;
        param["serialization_type"] = kind.into();
        param["val"] = value.into();
        save(ctx, id, &spec)?;
    }
    Ok(())
}

pub(super) fn decode(ctx: &StepContext<'_>) -> anyhow::Result<()> {
    for (id, mut spec) in param_operators(ctx)? {
        let param = &mut spec["param"];
        let Some(kind) = param["serialization_type"].as_str().map(str::to_string) else {
            continue;
        };
        let current = param["val"].as_str().unwrap_or_default().to_string();
        let (_, legacy) = run_helper(ctx.python, "decode", &kind, &current)
            .with_context(|| format!("Failed to restore param operator {}", id))?;
        param["val"] = legacy.into();
        if let Some(fields) = param.as_object_mut() {
            fields.remove("serialization_type");
        }
        save(ctx, id, &spec)?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::database::{Database, DbError, QueryExt, SqlValue, SqliteDatabase};
    use crate::migrator::{Migrator, Registry};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Stands in for the interpreter: ignores the script, answers like the SDK.
    fn fake_python(dir: &Path, answer: &str) -> PathBuf {
        let path = dir.join("python");
        std::fs::write(
            &path,
            format!("#!/bin/sh\ncat > /dev/null\nprintf '{}'\n", answer),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_helper_output_parsing() {
        let dir = TempDir::new().unwrap();
        let python = fake_python(dir.path(), "string\\nhello\\nworld\\n");
        let (kind, value) =
            run_helper(python.to_str().unwrap(), "encode", "", "\"x\"").unwrap();
        assert_eq!(kind, "string");
        assert_eq!(value, "hello\nworld");
    }

    #[test]
    fn test_helper_failure_surfaces_stderr() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("python");
        std::fs::write(&path, "#!/bin/sh\necho broken >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let err = run_helper(path.to_str().unwrap(), "encode", "", "1").unwrap_err();
        assert!(err.to_string().contains("broken"), "got {}", err);
    }

    #[test]
    fn test_param_operators_classified() -> Result<(), DbError> {
        let dir = TempDir::new().unwrap();
        let db: Arc<dyn Database> =
            Arc::new(SqliteDatabase::open(&dir.path().join("c.db")).unwrap());
        Migrator::new(db.clone(), Registry::builtin()).goto(9).unwrap();

        let param = Uuid::new_v4();
        let function = Uuid::new_v4();
        for (id, spec) in [
            (param, r#"{"type":"param","param":{"val":"\"hello\""}}"#),
            (
                function,
                r#"{"type":"function","function":{"type":"file","storage_path":"op.zip"}}"#,
            ),
        ] {
            db.execute(
                "INSERT INTO operator (id, name, description, spec) VALUES ($1, 'op', '', $2)",
                &sql_args![id, spec],
            )
            .unwrap();
        }

        let python = fake_python(dir.path(), "string\\nhello\\n");
        Migrator::new(db.clone(), Registry::builtin())
            .with_python(python.to_str().unwrap())
            .up()
            .unwrap();

        let spec: serde_json::Value = db
            .query_scalar("SELECT spec FROM operator WHERE id = $1", &[SqlValue::Uuid(param)])
            .unwrap();
        assert_eq!(spec["param"]["serialization_type"], "string");
        assert_eq!(spec["param"]["val"], "hello");

        let untouched: serde_json::Value = db
            .query_scalar("SELECT spec FROM operator WHERE id = $1", &[SqlValue::Uuid(function)])
            .unwrap();
        assert!(untouched["function"].get("serialization_type").is_none());
        Ok(())
    }
}
