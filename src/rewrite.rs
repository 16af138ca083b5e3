// Compose manifest conflict rewriting.
//
// A restored stack must deploy on any host and must not block on side
// channels while it is being brought back up. Six transformations run in
// order, each independent and idempotent:
//
//   1. remap published host ports that are taken
//   2. drop `container_name`
//   3. drop static `ipv4_address`/`ipv6_address`
//   4. drop `healthcheck`, relax `service_healthy` dependencies
//   5. drop `dns`/`dns_search`
//   6. collect external networks so the engine side can create them
//
// The rewrite is purely syntactic; no semantic equivalence is claimed.

use crate::engine;
use crate::error::BackupError;
use bollard::Docker;
use std::collections::HashSet;
use tracing::warn;
use yaml_rust2::{yaml::Hash, Yaml, YamlEmitter, YamlLoader};

/// Snapshot of the live engine view the rewriter consults: host ports
/// already published by containers. The TCP bind probe is injected so
/// the transformation core stays testable without an engine.
#[derive(Debug, Default)]
pub struct HostView {
    pub published: HashSet<u16>,
}

#[derive(Debug)]
pub struct Rewrite {
    pub manifest: String,
    /// Human-readable remapping records, `service: 5432 -> 5433`.
    pub remappings: Vec<String>,
    /// External network names the deploy host must provide.
    pub external_networks: Vec<String>,
}

fn ykey(s: &str) -> Yaml {
    Yaml::String(s.to_string())
}

/// A host port is available iff a TCP bind succeeds AND no container
/// publishes it.
pub fn port_available<F>(port: u16, view: &HostView, port_free: &mut F) -> bool
where
    F: FnMut(u16) -> bool,
{
    !view.published.contains(&port) && port_free(port)
}

/// First available port at or above `start`. Never selects 65535.
pub fn find_free_port<F>(start: u16, view: &HostView, port_free: &mut F) -> Option<u16>
where
    F: FnMut(u16) -> bool,
{
    (start..=65534).find(|p| port_available(*p, view, port_free))
}

/// TCP bind probe: bind to 0.0.0.0 and close cleanly on drop.
pub fn tcp_port_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Apply all transformations against an injected host view.
pub fn rewrite_manifest_with<F>(
    manifest: &str,
    view: &HostView,
    port_free: &mut F,
) -> Result<Rewrite, BackupError>
where
    F: FnMut(u16) -> bool,
{
    let mut docs = YamlLoader::load_from_str(manifest)
        .map_err(|e| BackupError::Parse(format!("invalid compose manifest: {}", e)))?;
    if docs.is_empty() {
        return Err(BackupError::Parse("empty compose manifest".to_string()));
    }
    let doc = docs.remove(0);
    let Yaml::Hash(mut root) = doc else {
        return Err(BackupError::RewriteFailed(
            "manifest root is not a mapping".to_string(),
        ));
    };

    let mut remappings = Vec::new();
    if let Some(Yaml::Hash(services)) = root.get_mut(&ykey("services")) {
        for (name, body) in services.iter_mut() {
            let service = name.as_str().unwrap_or_default().to_string();
            let Yaml::Hash(body) = body else { continue };

            remap_service_ports(&service, body, view, port_free, &mut remappings)?;
            body.remove(&ykey("container_name"));
            strip_static_addresses(body);
            body.remove(&ykey("healthcheck"));
            relax_depends_on(body);
            body.remove(&ykey("dns"));
            body.remove(&ykey("dns_search"));
        }
    }

    let external_networks = collect_external_networks(&root);

    let mut out = String::new();
    YamlEmitter::new(&mut out)
        .dump(&Yaml::Hash(root))
        .map_err(|e| BackupError::RewriteFailed(format!("emit: {}", e)))?;
    out.push('\n');

    Ok(Rewrite {
        manifest: out,
        remappings,
        external_networks,
    })
}

/// Rewrite against the live engine, then make sure every referenced
/// external network exists (bridge driver, created when missing).
pub async fn rewrite_manifest(docker: &Docker, manifest: &str) -> Result<Rewrite, BackupError> {
    let view = match engine::published_host_ports(docker).await {
        Ok(published) => HostView { published },
        Err(e) => {
            warn!("port view unavailable, probing by TCP bind alone: {}", e);
            HostView::default()
        }
    };

    let rewrite = rewrite_manifest_with(manifest, &view, &mut tcp_port_free)?;

    for network in &rewrite.external_networks {
        engine::ensure_bridge_network(docker, network).await?;
    }

    Ok(rewrite)
}

fn remap_service_ports<F>(
    service: &str,
    body: &mut Hash,
    view: &HostView,
    port_free: &mut F,
    remappings: &mut Vec<String>,
) -> Result<(), BackupError>
where
    F: FnMut(u16) -> bool,
{
    let Some(Yaml::Array(ports)) = body.get_mut(&ykey("ports")) else {
        return Ok(());
    };

    for entry in ports.iter_mut() {
        let Some(spec) = entry.as_str() else { continue };
        if let Some((rewritten, from, to)) = remap_port_spec(service, spec, view, port_free)? {
            remappings.push(format!("{}: {} -> {}", service, from, to));
            *entry = Yaml::String(rewritten);
        }
    }
    Ok(())
}

/// Remap a short-form `H:C[/proto]` (or `IP:H:C`) mapping whose host
/// port is taken. Container-only specs and long-form entries pass
/// through untouched.
fn remap_port_spec<F>(
    service: &str,
    spec: &str,
    view: &HostView,
    port_free: &mut F,
) -> Result<Option<(String, u16, u16)>, BackupError>
where
    F: FnMut(u16) -> bool,
{
    let (body, proto) = match spec.split_once('/') {
        Some((body, proto)) => (body, Some(proto)),
        None => (spec, None),
    };

    let parts: Vec<&str> = body.split(':').collect();
    let host_idx = match parts.len() {
        2 => 0,
        3 => 1,
        _ => return Ok(None),
    };
    let Ok(host) = parts[host_idx].parse::<u16>() else {
        return Ok(None);
    };

    if port_available(host, view, port_free) {
        return Ok(None);
    }

    let replacement = host
        .checked_add(1)
        .and_then(|start| find_free_port(start, view, port_free))
        .ok_or_else(|| {
            BackupError::RewriteFailed(format!(
                "no free host port above {} for service {}",
                host, service
            ))
        })?;

    let mut rebuilt: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    rebuilt[host_idx] = replacement.to_string();
    let mut rewritten = rebuilt.join(":");
    if let Some(proto) = proto {
        rewritten.push('/');
        rewritten.push_str(proto);
    }

    Ok(Some((rewritten, host, replacement)))
}

fn strip_static_addresses(body: &mut Hash) {
    if let Some(Yaml::Hash(networks)) = body.get_mut(&ykey("networks")) {
        for (_, attachment) in networks.iter_mut() {
            if let Yaml::Hash(attachment) = attachment {
                attachment.remove(&ykey("ipv4_address"));
                attachment.remove(&ykey("ipv6_address"));
            }
        }
    }
}

/// `depends_on` object form: a `service_healthy` condition cannot be met
/// once healthchecks are stripped, so it becomes `service_started`.
fn relax_depends_on(body: &mut Hash) {
    if let Some(Yaml::Hash(deps)) = body.get_mut(&ykey("depends_on")) {
        for (_, dep) in deps.iter_mut() {
            let Yaml::Hash(dep) = dep else { continue };
            if dep.get(&ykey("condition")).and_then(|c| c.as_str()) == Some("service_healthy") {
                dep.insert(ykey("condition"), Yaml::String("service_started".to_string()));
            }
        }
    }
}

fn collect_external_networks(root: &Hash) -> Vec<String> {
    let mut names = Vec::new();
    let Some(Yaml::Hash(networks)) = root.get(&ykey("networks")) else {
        return names;
    };

    for (key, def) in networks {
        let fallback = key.as_str().unwrap_or_default().to_string();
        let Yaml::Hash(def) = def else { continue };

        let declared_name = def
            .get(&ykey("name"))
            .and_then(|n| n.as_str())
            .map(|n| n.to_string());

        let resolved = match def.get(&ykey("external")) {
            Some(Yaml::Boolean(true)) => declared_name.unwrap_or(fallback),
            Some(Yaml::String(s)) if s.as_str() == "true" => declared_name.unwrap_or(fallback),
            Some(Yaml::String(s)) if s.as_str() == "false" => continue,
            Some(Yaml::String(s)) => s.clone(),
            Some(Yaml::Hash(ext)) => ext
                .get(&ykey("name"))
                .and_then(|n| n.as_str())
                .map(|n| n.to_string())
                .or(declared_name)
                .unwrap_or(fallback),
            _ => continue,
        };
        if !resolved.is_empty() {
            names.push(resolved);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
services:
  db:
    image: postgres:16
    container_name: shop-db
    ports:
      - "5432:5432"
    healthcheck:
      test: ["CMD", "pg_isready"]
    dns:
      - 1.1.1.1
    dns_search: example.internal
    networks:
      backend:
        ipv4_address: 172.28.0.10
        ipv6_address: fd00::10
  app:
    image: acme/shop:2
    ports:
      - "8080:80"
      - "9090:9090/udp"
    depends_on:
      db:
        condition: service_healthy
networks:
  backend: {}
  edge:
    external: true
"#;

    fn all_free() -> impl FnMut(u16) -> bool {
        |_| true
    }

    #[test]
    fn test_erases_conflicting_keys() {
        let rewrite =
            rewrite_manifest_with(MANIFEST, &HostView::default(), &mut all_free()).unwrap();
        for key in [
            "container_name",
            "healthcheck",
            "dns_search",
            "ipv4_address",
            "ipv6_address",
        ] {
            assert!(!rewrite.manifest.contains(key), "{} survived rewrite", key);
        }
        // `dns:` gone but the word can't be grepped (dns_search shares it);
        // reparse and check the service mapping directly.
        let docs = YamlLoader::load_from_str(&rewrite.manifest).unwrap();
        assert!(docs[0]["services"]["db"]["dns"].is_badvalue());
    }

    #[test]
    fn test_relaxes_healthy_condition() {
        let rewrite =
            rewrite_manifest_with(MANIFEST, &HostView::default(), &mut all_free()).unwrap();
        assert!(rewrite.manifest.contains("service_started"));
        assert!(!rewrite.manifest.contains("service_healthy"));
    }

    #[test]
    fn test_remaps_taken_ports() {
        let mut view = HostView::default();
        view.published.insert(5432);

        let rewrite = rewrite_manifest_with(MANIFEST, &view, &mut all_free()).unwrap();
        assert!(rewrite.manifest.contains("5433:5432"));
        assert_eq!(rewrite.remappings, vec!["db: 5432 -> 5433".to_string()]);
    }

    #[test]
    fn test_port_probe_needs_both_conditions() {
        // 8080 is bindable but already published by a container.
        let mut view = HostView::default();
        view.published.insert(8080);
        view.published.insert(8081);

        let rewrite = rewrite_manifest_with(MANIFEST, &view, &mut all_free()).unwrap();
        assert!(rewrite.manifest.contains("8082:80"));
        assert!(rewrite
            .remappings
            .contains(&"app: 8080 -> 8082".to_string()));
    }

    #[test]
    fn test_udp_suffix_preserved() {
        let mut taken = HashSet::new();
        taken.insert(9090u16);
        let rewrite = rewrite_manifest_with(
            MANIFEST,
            &HostView { published: taken },
            &mut all_free(),
        )
        .unwrap();
        assert!(rewrite.manifest.contains("9091:9090/udp"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let mut view = HostView::default();
        view.published.insert(5432);
        view.published.insert(8080);

        let first = rewrite_manifest_with(MANIFEST, &view, &mut all_free()).unwrap();
        let second = rewrite_manifest_with(&first.manifest, &view, &mut all_free()).unwrap();
        assert_eq!(first.manifest, second.manifest);
        assert!(second.remappings.is_empty());
    }

    #[test]
    fn test_external_networks_resolved() {
        let rewrite =
            rewrite_manifest_with(MANIFEST, &HostView::default(), &mut all_free()).unwrap();
        assert_eq!(rewrite.external_networks, vec!["edge".to_string()]);

        let named = r#"
services: {}
networks:
  edge:
    external:
      name: frontier
"#;
        let rewrite = rewrite_manifest_with(named, &HostView::default(), &mut all_free()).unwrap();
        assert_eq!(rewrite.external_networks, vec!["frontier".to_string()]);
    }

    #[test]
    fn test_probe_never_selects_65535() {
        assert_eq!(
            find_free_port(65530, &HostView::default(), &mut |p| p == 65534),
            Some(65534)
        );
        assert_eq!(
            find_free_port(65530, &HostView::default(), &mut |p| p == 65535),
            None
        );
    }

    #[test]
    fn test_exhausted_port_space_fails_cleanly() {
        let manifest = r#"
services:
  web:
    image: nginx
    ports:
      - "65534:80"
"#;
        let mut view = HostView::default();
        view.published.insert(65534);
        let err = rewrite_manifest_with(manifest, &view, &mut all_free()).unwrap_err();
        assert!(matches!(err, BackupError::RewriteFailed(_)));
    }

    #[test]
    fn test_container_only_ports_untouched() {
        let manifest = r#"
services:
  web:
    image: nginx
    ports:
      - "80"
"#;
        let rewrite =
            rewrite_manifest_with(manifest, &HostView::default(), &mut |_| false).unwrap();
        assert!(rewrite.remappings.is_empty());
    }
}
