// Compose manifest parsing.
//
// Extracts the small slice of a manifest the backup core consumes: per
// service the image, the declared volume destinations and the environment
// overrides. Unknown keys pass through untouched; the manifest text itself
// stays authoritative for redeploys.

use crate::error::BackupError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use yaml_rust2::{Yaml, YamlLoader};

/// What one compose service declares, as far as backup cares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub image: String,
    /// Absolute container-side destinations, in declaration order.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Environment overrides, both array and map form normalized to K->V.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Parsed view of a manifest: optional top-level name plus per-service
/// specs keyed by service name.
#[derive(Debug, Clone, Default)]
pub struct ParsedCompose {
    pub stack_name: Option<String>,
    pub services: BTreeMap<String, ServiceSpec>,
}

/// Parse a compose manifest. Fails with a parse error when the YAML is
/// malformed or `services` is not a mapping.
pub fn parse_manifest(manifest: &str) -> Result<ParsedCompose, BackupError> {
    let docs = YamlLoader::load_from_str(manifest)
        .map_err(|e| BackupError::Parse(format!("invalid compose manifest: {}", e)))?;
    let doc = match docs.first() {
        Some(doc) => doc,
        None => return Err(BackupError::Parse("empty compose manifest".to_string())),
    };

    let stack_name = doc["name"].as_str().map(|s| s.to_string());

    let services_yaml = &doc["services"];
    let services_hash = services_yaml
        .as_hash()
        .ok_or_else(|| BackupError::Parse("compose manifest has no services mapping".to_string()))?;

    let mut services = BTreeMap::new();
    for (name, body) in services_hash {
        let Some(name) = name.as_str() else { continue };
        services.insert(name.to_string(), parse_service(body));
    }

    Ok(ParsedCompose {
        stack_name,
        services,
    })
}

fn parse_service(body: &Yaml) -> ServiceSpec {
    let image = body["image"].as_str().unwrap_or_default().to_string();

    let mut volumes = Vec::new();
    if let Some(entries) = body["volumes"].as_vec() {
        for entry in entries {
            if let Some(dest) = volume_destination(entry) {
                volumes.push(dest);
            }
        }
    }

    ServiceSpec {
        image,
        volumes,
        env: parse_environment(&body["environment"]),
    }
}

/// Container-side destination of a volume declaration.
///
/// Short form `HOST:CONTAINER[:ro]` and bare `CONTAINER` keep the
/// container part; long form keeps `target`.
fn volume_destination(entry: &Yaml) -> Option<String> {
    match entry {
        Yaml::String(s) => {
            let parts: Vec<&str> = s.split(':').collect();
            let dest = if parts.len() >= 2 { parts[1] } else { parts[0] };
            if dest.is_empty() {
                None
            } else {
                Some(dest.to_string())
            }
        }
        Yaml::Hash(_) => entry["target"].as_str().map(|s| s.to_string()),
        _ => None,
    }
}

/// Environment in either array (`K=V`) or map form. Split at the first
/// `=`; an empty value is permitted, as is a bare key.
fn parse_environment(env: &Yaml) -> HashMap<String, String> {
    let mut out = HashMap::new();
    match env {
        Yaml::Array(entries) => {
            for entry in entries {
                let Some(line) = entry.as_str() else { continue };
                match line.split_once('=') {
                    Some((k, v)) => out.insert(k.to_string(), v.to_string()),
                    None => out.insert(line.to_string(), String::new()),
                };
            }
        }
        Yaml::Hash(map) => {
            for (k, v) in map {
                let Some(key) = k.as_str() else { continue };
                out.insert(key.to_string(), scalar_to_string(v));
            }
        }
        _ => {}
    }
    out
}

fn scalar_to_string(value: &Yaml) -> String {
    match value {
        Yaml::String(s) => s.clone(),
        Yaml::Integer(i) => i.to_string(),
        Yaml::Real(r) => r.clone(),
        Yaml::Boolean(b) => b.to_string(),
        _ => String::new(),
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap());

/// Resolve `${VAR}` / `${VAR:-default}` placeholders.
///
/// Precedence: provided map, then process environment, then the inline
/// default. Unresolved placeholders become empty strings. No recursive
/// expansion.
pub fn resolve_placeholders(input: &str, env: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures| {
            let var = &caps[1];
            if let Some(value) = env.get(var) {
                return value.clone();
            }
            if let Ok(value) = std::env::var(var) {
                return value;
            }
            caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default()
        })
        .into_owned()
}

/// Parse `.env`-style `K=V` lines, skipping comments and blanks.
pub fn parse_env_lines(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            out.insert(k.trim().to_string(), v.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: shop
services:
  db:
    image: postgres:16
    environment:
      POSTGRES_USER: shop
      POSTGRES_PASSWORD: s3cret
      POSTGRES_MAX: 100
    volumes:
      - dbdata:/var/lib/postgresql/data
  web:
    image: nginx:1.27
    environment:
      - UPSTREAM=db:5432
      - EMPTY=
      - PASSTHROUGH
    volumes:
      - ./site:/usr/share/nginx/html:ro
      - /var/cache/nginx
      - type: bind
        source: ./certs
        target: /etc/nginx/certs
"#;

    #[test]
    fn test_parse_services_and_name() {
        let parsed = parse_manifest(MANIFEST).unwrap();
        assert_eq!(parsed.stack_name.as_deref(), Some("shop"));
        assert_eq!(parsed.services.len(), 2);
        assert_eq!(parsed.services["db"].image, "postgres:16");
        assert_eq!(parsed.services["web"].image, "nginx:1.27");
    }

    #[test]
    fn test_volume_destination_forms() {
        let parsed = parse_manifest(MANIFEST).unwrap();
        assert_eq!(
            parsed.services["db"].volumes,
            vec!["/var/lib/postgresql/data"]
        );
        assert_eq!(
            parsed.services["web"].volumes,
            vec![
                "/usr/share/nginx/html",
                "/var/cache/nginx",
                "/etc/nginx/certs"
            ]
        );
    }

    #[test]
    fn test_environment_forms() {
        let parsed = parse_manifest(MANIFEST).unwrap();
        let db = &parsed.services["db"].env;
        assert_eq!(db["POSTGRES_USER"], "shop");
        assert_eq!(db["POSTGRES_PASSWORD"], "s3cret");
        assert_eq!(db["POSTGRES_MAX"], "100");

        let web = &parsed.services["web"].env;
        assert_eq!(web["UPSTREAM"], "db:5432");
        assert_eq!(web["EMPTY"], "");
        assert_eq!(web["PASSTHROUGH"], "");
    }

    #[test]
    fn test_malformed_manifest_is_parse_error() {
        let err = parse_manifest("services: [not: a: mapping").unwrap_err();
        assert!(matches!(err, BackupError::Parse(_)));

        let err = parse_manifest("version: '3'").unwrap_err();
        assert!(matches!(err, BackupError::Parse(_)));
    }

    #[test]
    fn test_placeholder_precedence() {
        let mut env = HashMap::new();
        env.insert("A".to_string(), "from-map".to_string());

        assert_eq!(resolve_placeholders("${A}", &env), "from-map");
        // Map beats the inline default.
        assert_eq!(resolve_placeholders("${A:-fallback}", &env), "from-map");
        // Default used when nothing else matches.
        assert_eq!(
            resolve_placeholders("${DOCKVAULT_TEST_UNSET_VAR:-fallback}", &env),
            "fallback"
        );
        // Unresolved placeholders become empty.
        assert_eq!(resolve_placeholders("x${DOCKVAULT_TEST_UNSET_VAR}y", &env), "xy");
    }

    #[test]
    fn test_placeholder_process_env() {
        std::env::set_var("DOCKVAULT_TEST_SET_VAR", "from-process");
        let env = HashMap::new();
        assert_eq!(
            resolve_placeholders("${DOCKVAULT_TEST_SET_VAR:-fallback}", &env),
            "from-process"
        );
    }

    #[test]
    fn test_env_lines() {
        let parsed = parse_env_lines("# comment\nA=1\n\nB=two=three\nBROKEN\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "two=three");
    }
}
