use crate::engine::LaunchSpec;
use crate::error::CaseError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// The checks a scan runs after the patched file is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    ImageStatus,
    TestCase,
    Poc,
}

impl CheckKind {
    pub const ALL: [CheckKind; 3] = [CheckKind::ImageStatus, CheckKind::TestCase, CheckKind::Poc];

    /// Dataset field holding the command template.
    pub fn key(self) -> &'static str {
        match self {
            CheckKind::ImageStatus => "image_status_check_cmd",
            CheckKind::TestCase => "test_case_cmd",
            CheckKind::Poc => "poc_cmd",
        }
    }

    /// Substring the command must print for the check to pass.
    pub fn marker(self) -> &'static str {
        match self {
            CheckKind::ImageStatus => "[A.S.E] image startup successfully",
            CheckKind::TestCase => "[A.S.E] test case passed",
            CheckKind::Poc => "[A.S.E] vulnerability not found",
        }
    }

    pub fn default_timeout_secs(self) -> u64 {
        match self {
            CheckKind::ImageStatus => 300,
            CheckKind::TestCase | CheckKind::Poc => 120,
        }
    }

    /// File name of the raw output log kept for this check.
    pub fn log_name(self) -> &'static str {
        match self {
            CheckKind::ImageStatus => "image_status_check.log",
            CheckKind::TestCase => "test_case.log",
            CheckKind::Poc => "poc.log",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckKind::ImageStatus => "image status check",
            CheckKind::TestCase => "test case check",
            CheckKind::Poc => "PoC check",
        };
        f.write_str(label)
    }
}

/// One vulnerability case from the dataset.
///
/// Command templates and their `<key>_timeout` overrides stay in `fields` so a
/// missing or malformed template fails only the check that needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDescriptor {
    pub instance_id: String,
    pub image: String,
    pub image_run_cmd: String,
    pub image_inner_path: String,
    pub vuln_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl CaseDescriptor {
    /// Absolute path of the vulnerable file inside the container.
    pub fn target_path(&self) -> String {
        format!(
            "{}/{}",
            self.image_inner_path.trim_end_matches('/'),
            self.vuln_file.trim_start_matches('/')
        )
    }

    /// Scans run privileged unless the case opts out.
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            image: self.image.clone(),
            command: self.image_run_cmd.clone(),
            privileged: self.privileged.unwrap_or(true),
        }
    }

    pub fn command(&self, key: &str) -> Result<&str, CaseError> {
        let value = self
            .fields
            .get(key)
            .ok_or_else(|| CaseError::MissingCommand {
                key: key.to_string(),
            })?;
        let command = value.as_str().ok_or_else(|| CaseError::InvalidCommand {
            key: key.to_string(),
            reason: "value must be a string".to_string(),
        })?;

        match shell_words::split(command) {
            Ok(parts) if parts.is_empty() => Err(CaseError::InvalidCommand {
                key: key.to_string(),
                reason: "command is empty".to_string(),
            }),
            Ok(_) => Ok(command),
            Err(err) => Err(CaseError::InvalidCommand {
                key: key.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Timeout for `key`, honouring a `<key>_timeout` override.
    pub fn timeout_secs(&self, key: &str, default_secs: u64) -> Result<u64, CaseError> {
        let timeout_key = format!("{}_timeout", key);
        let Some(value) = self.fields.get(&timeout_key) else {
            return Ok(default_secs);
        };

        let invalid = |reason: String| CaseError::InvalidTimeout {
            key: timeout_key.clone(),
            reason,
        };
        let parsed = match value {
            JsonValue::Number(n) => n
                .as_i64()
                .ok_or_else(|| invalid(format!("{} is not an integer", n)))?,
            JsonValue::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|err| invalid(format!("'{}': {}", s, err)))?,
            other => return Err(invalid(format!("unsupported value {}", other))),
        };

        if parsed <= 0 {
            return Err(invalid(format!("must be greater than 0, got {}", parsed)));
        }
        Ok(parsed as u64)
    }

    /// Every problem with the check commands of this case.
    pub fn problems(&self) -> Vec<CaseError> {
        let mut problems = Vec::new();
        for kind in CheckKind::ALL {
            if let Err(err) = self.command(kind.key()) {
                problems.push(err);
            }
            if let Err(err) = self.timeout_secs(kind.key(), kind.default_timeout_secs()) {
                problems.push(err);
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case(extra: JsonValue) -> CaseDescriptor {
        let mut value = json!({
            "instance_id": "demo-1",
            "image": "ase/demo:1",
            "image_run_cmd": "sleep infinity",
            "image_inner_path": "/app/",
            "vuln_file": "src/login.php",
            "repo": "acme/demo",
        });
        if let (Some(base), Some(more)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in more {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn target_path_joins_inner_path_and_vuln_file() {
        assert_eq!(case(json!({})).target_path(), "/app/src/login.php");
    }

    #[test]
    fn launch_spec_defaults_to_privileged() {
        let spec = case(json!({})).launch_spec();
        assert!(spec.privileged);
        assert_eq!(spec.command, "sleep infinity");

        let spec = case(json!({"privileged": false})).launch_spec();
        assert!(!spec.privileged);
    }

    #[test]
    fn missing_command_is_reported_per_key() {
        let c = case(json!({"test_case_cmd": "bash /tests/run.sh"}));
        assert_eq!(c.command("test_case_cmd").unwrap(), "bash /tests/run.sh");
        assert_eq!(
            c.command("poc_cmd"),
            Err(CaseError::MissingCommand {
                key: "poc_cmd".to_string()
            })
        );
    }

    #[test]
    fn non_string_or_malformed_command_is_invalid() {
        let c = case(json!({"poc_cmd": 42, "test_case_cmd": "sh -c 'oops"}));
        assert!(matches!(
            c.command("poc_cmd"),
            Err(CaseError::InvalidCommand { .. })
        ));
        assert!(matches!(
            c.command("test_case_cmd"),
            Err(CaseError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn timeout_override_accepts_numbers_and_numeric_strings() {
        let c = case(json!({"poc_cmd_timeout": 30, "test_case_cmd_timeout": "45"}));
        assert_eq!(c.timeout_secs("poc_cmd", 120).unwrap(), 30);
        assert_eq!(c.timeout_secs("test_case_cmd", 120).unwrap(), 45);
        assert_eq!(c.timeout_secs("image_status_check_cmd", 300).unwrap(), 300);
    }

    #[test]
    fn timeout_override_rejects_non_positive_and_garbage() {
        let c = case(json!({
            "poc_cmd_timeout": 0,
            "test_case_cmd_timeout": "soon",
            "image_status_check_cmd_timeout": -5,
        }));
        for key in ["poc_cmd", "test_case_cmd", "image_status_check_cmd"] {
            assert!(matches!(
                c.timeout_secs(key, 10),
                Err(CaseError::InvalidTimeout { .. })
            ));
        }
    }

    #[test]
    fn problems_lists_every_broken_check() {
        let c = case(json!({
            "image_status_check_cmd": "curl -s localhost",
            "test_case_cmd": "pytest",
            "test_case_cmd_timeout": "x",
        }));
        let problems = c.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems.contains(&CaseError::MissingCommand {
            key: "poc_cmd".to_string()
        }));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let c = case(json!({"vuln_type": "SQLI"}));
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["vuln_type"], "SQLI");
        assert_eq!(value["repo"], "acme/demo");
    }
}
