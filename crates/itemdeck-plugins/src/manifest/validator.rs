//! Manifest validation pipeline
//!
//! Four stages run in order: structural, semantic, security and content
//! policy. Every problem of a stage is reported together; a failing stage
//! stops the pipeline. Validation performs no I/O and depends only on the
//! raw document, the source tier and the host version.

use super::policy::{self, InlineScriptScanner, PathKind};
use super::{PluginManifest, PluginType};
use crate::capability::{Capability, CapabilityAccess, Tier};
use crate::error::{PluginError, PluginResult, ValidationError, ValidationStage};
use regex::Regex;
use semver::{Version, VersionReq};
use serde_json::{Map, Value};
use std::collections::HashSet;

const ID_PATTERN: &str = r"^[a-z0-9][a-z0-9-]*(\.[a-z0-9][a-z0-9-]*)+$";
const ID_MIN_LEN: usize = 3;
const ID_MAX_LEN: usize = 100;
const MAX_KEYWORDS: usize = 10;
const MAX_SCREENSHOTS: usize = 10;

const ROOT_FIELDS: &[&str] = &[
    "$schema",
    "id",
    "name",
    "version",
    "description",
    "author",
    "licence",
    "homepage",
    "repository",
    "keywords",
    "itemdeck",
    "capabilities",
    "dependencies",
    "assets",
    "config",
    "entry",
    "contributes",
];
const AUTHOR_FIELDS: &[&str] = &["name", "url", "email"];
const ITEMDECK_FIELDS: &[&str] = &["minVersion", "maxVersion", "type", "tier"];
const DEPENDENCY_FIELDS: &[&str] = &["required", "optional"];
const ASSET_FIELDS: &[&str] = &["icon", "banner", "screenshots"];
const CONFIG_FIELDS: &[&str] = &["schema", "defaults"];
const ENTRY_FIELDS: &[&str] = &["main", "styles", "worker"];
const CONTRIBUTION_FIELDS: &[&str] = &["settings", "themes", "mechanics", "sources"];

/// Inputs that decide the outcome besides the document itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    /// Tier of the source the manifest came from
    pub tier: Tier,
    pub host_version: Version,
}

impl ValidationContext {
    pub fn new(tier: Tier, host_version: Version) -> Self {
        Self { tier, host_version }
    }
}

/// Validate a raw manifest document for the given context
pub fn validate(raw: &Value, ctx: &ValidationContext) -> PluginResult<PluginManifest> {
    Validator::new(ctx.host_version.clone())?.validate(raw, ctx.tier)
}

/// Parse a semver range; `||` separates alternatives
pub fn parse_range(range: &str) -> Result<Vec<VersionReq>, String> {
    range
        .split("||")
        .map(str::trim)
        .map(|part| {
            if part.is_empty() {
                Err(format!("'{}' has an empty alternative", range))
            } else {
                VersionReq::parse(part).map_err(|e| format!("'{}' is not a valid semver range: {}", part, e))
            }
        })
        .collect()
}

/// Whether `version` satisfies any alternative of `range`
pub fn range_matches(range: &[VersionReq], version: &Version) -> bool {
    range.iter().any(|req| req.matches(version))
}

/// Errors collected for one stage
struct Findings {
    stage: ValidationStage,
    errors: Vec<ValidationError>,
}

impl Findings {
    fn new(stage: ValidationStage) -> Self {
        Self {
            stage,
            errors: Vec::new(),
        }
    }

    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError::new(self.stage, path, message));
    }

    fn finish(self) -> PluginResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(PluginError::ValidationFailed(self.errors))
        }
    }
}

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn as_object<'a>(f: &mut Findings, value: &'a Value, path: &str) -> Option<&'a Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        other => {
            f.push(path, format!("expected an object, found {}", kind_of(other)));
            None
        }
    }
}

fn as_string<'a>(f: &mut Findings, value: &'a Value, path: &str) -> Option<&'a str> {
    match value {
        Value::String(s) => Some(s),
        other => {
            f.push(path, format!("expected a string, found {}", kind_of(other)));
            None
        }
    }
}

fn check_fields(f: &mut Findings, map: &Map<String, Value>, path: &str, allowed: &[&str]) {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            f.push(join(path, key), "unknown field");
        }
    }
}

fn required<'a>(f: &mut Findings, map: &'a Map<String, Value>, path: &str, field: &str) -> Option<&'a Value> {
    let value = map.get(field);
    if value.is_none() {
        f.push(join(path, field), "missing required field");
    }
    value
}

fn required_string<'a>(f: &mut Findings, map: &'a Map<String, Value>, path: &str, field: &str) -> Option<&'a str> {
    required(f, map, path, field).and_then(|v| as_string(f, v, &join(path, field)))
}

/// Optional fields must be absent rather than null
fn optional_string<'a>(f: &mut Findings, map: &'a Map<String, Value>, path: &str, field: &str) -> Option<&'a str> {
    map.get(field).and_then(|v| as_string(f, v, &join(path, field)))
}

fn optional_object<'a>(
    f: &mut Findings,
    map: &'a Map<String, Value>,
    path: &str,
    field: &str,
    allowed: &[&str],
) -> Option<&'a Map<String, Value>> {
    let full = join(path, field);
    let object = map.get(field).and_then(|v| as_object(f, v, &full))?;
    check_fields(f, object, &full, allowed);
    Some(object)
}

fn optional_array<'a>(
    f: &mut Findings,
    map: &'a Map<String, Value>,
    path: &str,
    field: &str,
    max: Option<usize>,
) -> Option<&'a Vec<Value>> {
    let full = join(path, field);
    match map.get(field)? {
        Value::Array(items) => {
            if let Some(max) = max.filter(|max| items.len() > *max) {
                f.push(&full, format!("at most {} entries allowed, found {}", max, items.len()));
            }
            Some(items)
        }
        other => {
            f.push(full, format!("expected an array, found {}", kind_of(other)));
            None
        }
    }
}

fn string_array(f: &mut Findings, map: &Map<String, Value>, path: &str, field: &str, max: Option<usize>) {
    if let Some(items) = optional_array(f, map, path, field, max) {
        let full = join(path, field);
        for (i, item) in items.iter().enumerate() {
            as_string(f, item, &format!("{}[{}]", full, i));
        }
    }
}

/// Runs the validation pipeline against a fixed host version
#[derive(Debug, Clone)]
pub struct Validator {
    host_version: Version,
    id_pattern: Regex,
    scanner: InlineScriptScanner,
}

impl Validator {
    pub fn new(host_version: Version) -> PluginResult<Self> {
        let id_pattern = Regex::new(ID_PATTERN).map_err(|e| PluginError::Config(e.to_string()))?;
        let scanner = InlineScriptScanner::new().map_err(|e| PluginError::Config(e.to_string()))?;
        Ok(Self {
            host_version,
            id_pattern,
            scanner,
        })
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Whether `id` is a well-formed plugin id
    pub fn is_valid_id(&self, id: &str) -> bool {
        (ID_MIN_LEN..=ID_MAX_LEN).contains(&id.len()) && self.id_pattern.is_match(id)
    }

    /// Parse and validate raw manifest bytes
    pub fn validate_bytes(&self, bytes: &[u8], tier: Tier) -> PluginResult<PluginManifest> {
        let raw: Value = serde_json::from_slice(bytes).map_err(|e| {
            PluginError::invalid(ValidationStage::Structural, "", format!("manifest is not valid JSON: {}", e))
        })?;
        self.validate(&raw, tier)
    }

    pub fn validate(&self, raw: &Value, tier: Tier) -> PluginResult<PluginManifest> {
        let mut findings = Findings::new(ValidationStage::Structural);
        self.structural(raw, &mut findings);
        findings.finish()?;

        let manifest: PluginManifest = serde_json::from_value(raw.clone())
            .map_err(|e| PluginError::invalid(ValidationStage::Structural, "", e.to_string()))?;

        let mut findings = Findings::new(ValidationStage::Semantic);
        self.semantic(&manifest, &mut findings);
        findings.finish()?;

        let mut findings = Findings::new(ValidationStage::Security);
        Self::security(&manifest, tier, &mut findings);
        findings.finish()?;

        let mut findings = Findings::new(ValidationStage::Content);
        self.content(&manifest, raw, &mut findings);
        findings.finish()?;

        Ok(manifest)
    }

    fn structural(&self, raw: &Value, f: &mut Findings) {
        let Some(root) = as_object(f, raw, "") else {
            return;
        };
        check_fields(f, root, "", ROOT_FIELDS);

        optional_string(f, root, "", "$schema");

        if let Some(id) = required_string(f, root, "", "id") {
            if !(ID_MIN_LEN..=ID_MAX_LEN).contains(&id.len()) {
                f.push("id", format!("must be {}-{} characters long", ID_MIN_LEN, ID_MAX_LEN));
            } else if !self.id_pattern.is_match(id) {
                f.push("id", "must be lowercase reverse-domain segments joined by dots");
            }
        }
        if let Some(name) = required_string(f, root, "", "name") {
            if name.trim().is_empty() {
                f.push("name", "must not be empty");
            }
        }
        if let Some(version) = required_string(f, root, "", "version") {
            if let Err(e) = Version::parse(version) {
                f.push("version", format!("'{}' is not a valid semver version: {}", version, e));
            }
        }
        required_string(f, root, "", "description");

        if let Some(author) = required(f, root, "", "author").and_then(|v| as_object(f, v, "author")) {
            check_fields(f, author, "author", AUTHOR_FIELDS);
            if let Some(name) = required_string(f, author, "author", "name") {
                if name.trim().is_empty() {
                    f.push("author.name", "must not be empty");
                }
            }
            optional_string(f, author, "author", "url");
            optional_string(f, author, "author", "email");
        }

        optional_string(f, root, "", "licence");
        for field in ["homepage", "repository"] {
            if let Some(link) = optional_string(f, root, "", field) {
                if url::Url::parse(link).is_err() {
                    f.push(field, format!("'{}' is not a valid URL", link));
                }
            }
        }
        string_array(f, root, "", "keywords", Some(MAX_KEYWORDS));

        self.structural_itemdeck(root, f);
        Self::structural_capabilities(root, f);

        if let Some(deps) = optional_object(f, root, "", "dependencies", DEPENDENCY_FIELDS) {
            for field in DEPENDENCY_FIELDS {
                let path = join("dependencies", field);
                let Some(map) = deps.get(*field).and_then(|v| as_object(f, v, &path)) else {
                    continue;
                };
                for (id, range) in map {
                    let entry = format!("{}.{}", path, id);
                    if !self.is_valid_id(id) {
                        f.push(&entry, format!("'{}' is not a valid plugin id", id));
                    }
                    as_string(f, range, &entry);
                }
            }
        }

        if let Some(assets) = optional_object(f, root, "", "assets", ASSET_FIELDS) {
            optional_string(f, assets, "assets", "icon");
            optional_string(f, assets, "assets", "banner");
            string_array(f, assets, "assets", "screenshots", Some(MAX_SCREENSHOTS));
        }
        if let Some(config) = optional_object(f, root, "", "config", CONFIG_FIELDS) {
            for field in CONFIG_FIELDS {
                optional_string(f, config, "config", field);
            }
        }
        if let Some(entry) = optional_object(f, root, "", "entry", ENTRY_FIELDS) {
            for field in ENTRY_FIELDS {
                optional_string(f, entry, "entry", field);
            }
        }
        if let Some(contributes) = optional_object(f, root, "", "contributes", CONTRIBUTION_FIELDS) {
            for field in CONTRIBUTION_FIELDS {
                let Some(items) = optional_array(f, contributes, "contributes", field, None) else {
                    continue;
                };
                for (i, item) in items.iter().enumerate() {
                    as_object(f, item, &format!("contributes.{}[{}]", field, i));
                }
            }
        }
    }

    fn structural_itemdeck(&self, root: &Map<String, Value>, f: &mut Findings) {
        let Some(block) = required(f, root, "", "itemdeck").and_then(|v| as_object(f, v, "itemdeck")) else {
            return;
        };
        check_fields(f, block, "itemdeck", ITEMDECK_FIELDS);

        if let Some(min) = required_string(f, block, "itemdeck", "minVersion") {
            if let Err(e) = Version::parse(min) {
                f.push("itemdeck.minVersion", format!("'{}' is not a valid semver version: {}", min, e));
            }
        }
        if let Some(max) = optional_string(f, block, "itemdeck", "maxVersion") {
            if let Err(message) = parse_range(max) {
                f.push("itemdeck.maxVersion", message);
            }
        }
        if let Some(kind) = required_string(f, block, "itemdeck", "type") {
            if !PluginType::ALL.iter().any(|t| t.as_str() == kind) {
                f.push("itemdeck.type", format!("unknown plugin type '{}'", kind));
            }
        }
        if let Some(tier) = required_string(f, block, "itemdeck", "tier") {
            if let Err(message) = tier.parse::<Tier>() {
                f.push("itemdeck.tier", message);
            }
        }
    }

    fn structural_capabilities(root: &Map<String, Value>, f: &mut Findings) {
        let Some(items) = optional_array(f, root, "", "capabilities", None) else {
            return;
        };
        let mut seen = HashSet::new();
        for (i, item) in items.iter().enumerate() {
            let path = format!("capabilities[{}]", i);
            let Some(name) = as_string(f, item, &path) else {
                continue;
            };
            match name.parse::<Capability>() {
                Ok(cap) if !seen.insert(cap) => f.push(path, format!("duplicate capability '{}'", cap)),
                Ok(_) => {}
                Err(message) => f.push(path, message),
            }
        }
    }

    fn semantic(&self, manifest: &PluginManifest, f: &mut Findings) {
        let host = &self.host_version;

        if let Ok(min) = Version::parse(&manifest.itemdeck.min_version) {
            if &min > host {
                f.push(
                    "itemdeck.minVersion",
                    format!("requires host {} or newer, host is {}", min, host),
                );
            }
        }
        if let Some(max) = &manifest.itemdeck.max_version {
            match parse_range(max) {
                Ok(range) if !range_matches(&range, host) => f.push(
                    "itemdeck.maxVersion",
                    format!("host {} is outside the supported range '{}'", host, max),
                ),
                Ok(_) => {}
                Err(message) => f.push("itemdeck.maxVersion", message),
            }
        }

        if let Some(deps) = &manifest.dependencies {
            for (id, range, required) in deps.iter() {
                let path = format!(
                    "dependencies.{}.{}",
                    if required { "required" } else { "optional" },
                    id
                );
                if id == manifest.id {
                    f.push(&path, "a plugin cannot depend on itself");
                }
                if let Err(message) = parse_range(range) {
                    f.push(path, message);
                }
            }
        }
    }

    fn security(manifest: &PluginManifest, tier: Tier, f: &mut Findings) {
        for (i, capability) in manifest.capabilities.iter().enumerate() {
            if capability.access_for(tier) == CapabilityAccess::Blocked {
                f.push(
                    format!("capabilities[{}]", i),
                    format!("capability '{}' is blocked for {} plugins", capability, tier),
                );
            }
        }

        let claimed = manifest.declared_tier();
        if !tier.permits_claim(claimed) {
            f.push(
                "itemdeck.tier",
                format!("manifest claims tier '{}' but its source only allows '{}'", claimed, tier),
            );
        }
    }

    fn content(&self, manifest: &PluginManifest, raw: &Value, f: &mut Findings) {
        let mut check = |path: String, value: &str, kind: PathKind| {
            if let Some(message) = policy::check_path(value, kind) {
                f.push(path, message);
            }
        };

        if let Some(assets) = &manifest.assets {
            if let Some(icon) = &assets.icon {
                check("assets.icon".into(), icon, PathKind::Image);
            }
            if let Some(banner) = &assets.banner {
                check("assets.banner".into(), banner, PathKind::Image);
            }
            for (i, shot) in assets.screenshots.iter().flatten().enumerate() {
                check(format!("assets.screenshots[{}]", i), shot, PathKind::Image);
            }
        }
        if let Some(config) = &manifest.config {
            if let Some(schema) = &config.schema {
                check("config.schema".into(), schema, PathKind::Json);
            }
            if let Some(defaults) = &config.defaults {
                check("config.defaults".into(), defaults, PathKind::Json);
            }
        }
        if let Some(entry) = &manifest.entry {
            if let Some(main) = &entry.main {
                check("entry.main".into(), main, PathKind::Script);
            }
            if let Some(styles) = &entry.styles {
                check("entry.styles".into(), styles, PathKind::Stylesheet);
            }
            if let Some(worker) = &entry.worker {
                check("entry.worker".into(), worker, PathKind::Script);
            }
        }

        if let Some(contributes) = raw.get("contributes") {
            for path in self.scanner.scan(contributes, "contributes") {
                f.push(path, "inline executable content is not allowed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> Validator {
        Validator::new(Version::new(1, 2, 0)).unwrap()
    }

    fn minimal(id: &str, tier: &str) -> Value {
        json!({
            "id": id,
            "name": "Example",
            "version": "1.0.0",
            "description": "An example plugin",
            "author": { "name": "Example Author" },
            "itemdeck": { "minVersion": "1.0.0", "type": "theme", "tier": tier },
            "capabilities": []
        })
    }

    fn full() -> Value {
        json!({
            "$schema": "https://itemdeck.app/schemas/plugin.json",
            "id": "org.example.full-theme",
            "name": "Full Theme",
            "version": "2.1.0-beta.1",
            "description": "Every field set",
            "author": { "name": "Example", "url": "https://example.org", "email": "dev@example.org" },
            "licence": "MIT",
            "homepage": "https://example.org/theme",
            "repository": "https://git.example.org/theme",
            "keywords": ["retro", "cards"],
            "itemdeck": {
                "minVersion": "1.0.0",
                "maxVersion": "^1.0.0 || ^2.0.0",
                "type": "theme",
                "tier": "community"
            },
            "capabilities": ["storage:local", "ui:toolbar"],
            "dependencies": {
                "required": { "org.example.base": "^1.0" },
                "optional": { "org.example.extras": ">=0.3.0, <0.5.0" }
            },
            "assets": { "icon": "assets/icon.png", "banner": "assets/banner.webp", "screenshots": ["shots/1.png"] },
            "config": { "schema": "config/schema.json", "defaults": "config/defaults.json" },
            "entry": { "main": "dist/index.js", "styles": "dist/theme.css", "worker": "dist/worker.mjs" },
            "contributes": {
                "themes": [{ "id": "full", "colours": { "primary": "#112233" } }],
                "settings": [{ "key": "full.glow", "type": "boolean", "default": true }]
            }
        })
    }

    fn paths(err: &PluginError) -> Vec<&str> {
        err.validation_errors().iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_valid_manifest_round_trips() {
        let raw = full();
        let manifest = validator().validate(&raw, Tier::Community).unwrap();
        assert_eq!(manifest.to_value(), raw);
        assert_eq!(manifest.id, "org.example.full-theme");
    }

    #[test]
    fn test_minimal_manifest_round_trips() {
        let raw = minimal("org.itemdeck.theme-retro", "builtin");
        let manifest = validator().validate(&raw, Tier::Builtin).unwrap();
        assert_eq!(manifest.to_value(), raw);
    }

    #[test]
    fn test_structural_errors_accumulate() {
        let raw = json!({
            "id": "Not Valid",
            "name": "",
            "version": "one",
            "author": {},
            "itemdeck": { "minVersion": "1.0.0", "type": "widget", "tier": "community" },
            "capabilities": ["storage:local", "storage:local", "teleport"]
        });

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        let paths = paths(&err);
        for expected in [
            "id",
            "name",
            "version",
            "description",
            "author.name",
            "itemdeck.type",
            "capabilities[1]",
            "capabilities[2]",
        ] {
            assert!(paths.contains(&expected), "missing {expected} in {paths:?}");
        }
        assert!(err
            .validation_errors()
            .iter()
            .all(|e| e.stage == ValidationStage::Structural));
    }

    #[test]
    fn test_id_length_bounds() {
        let v = validator();
        assert!(v.is_valid_id("a.b"));
        assert!(!v.is_valid_id("ab"));
        assert!(!v.is_valid_id("single"));
        assert!(!v.is_valid_id(&format!("org.{}", "a".repeat(100))));
        assert!(!v.is_valid_id("org..example"));
        assert!(!v.is_valid_id("-org.example"));
    }

    #[test]
    fn test_array_limits() {
        let mut raw = minimal("org.example.many", "community");
        raw["keywords"] = json!((0..11).map(|i| format!("k{i}")).collect::<Vec<_>>());
        raw["assets"] = json!({ "screenshots": (0..11).map(|i| format!("s{i}.png")).collect::<Vec<_>>() });

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(paths(&err), vec!["keywords", "assets.screenshots"]);
    }

    #[test]
    fn test_unknown_and_null_fields_rejected() {
        let mut raw = minimal("org.example.extra", "community");
        raw["sandbox"] = json!(true);
        raw["licence"] = Value::Null;

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        let mut found = paths(&err);
        found.sort();
        assert_eq!(found, vec!["licence", "sandbox"]);
    }

    #[test]
    fn test_structural_failure_short_circuits() {
        let mut raw = minimal("org.example.bad", "community");
        raw["version"] = json!("x");
        raw["capabilities"] = json!(["dangerous:eval"]);

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(paths(&err), vec!["version"]);
    }

    #[test]
    fn test_host_version_bounds() {
        let mut raw = minimal("org.example.future", "community");
        raw["itemdeck"]["minVersion"] = json!("2.0.0");
        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(err.validation_errors()[0].stage, ValidationStage::Semantic);
        assert_eq!(paths(&err), vec!["itemdeck.minVersion"]);

        let mut raw = minimal("org.example.legacy", "community");
        raw["itemdeck"]["maxVersion"] = json!("~1.1");
        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(paths(&err), vec!["itemdeck.maxVersion"]);

        raw["itemdeck"]["maxVersion"] = json!("~1.1 || ~1.2");
        assert!(validator().validate(&raw, Tier::Community).is_ok());
    }

    #[test]
    fn test_invalid_max_version_is_structural() {
        let mut raw = minimal("org.example.range", "community");
        raw["itemdeck"]["maxVersion"] = json!("not a range");
        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(err.validation_errors()[0].stage, ValidationStage::Structural);
    }

    #[test]
    fn test_dependency_ranges_must_parse() {
        let mut raw = minimal("org.example.deps", "community");
        raw["dependencies"] = json!({
            "required": { "org.example.base": "latest", "org.example.deps": "^1" },
            "optional": { "org.example.ok": "*" }
        });

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(err.validation_errors()[0].stage, ValidationStage::Semantic);
        assert_eq!(
            paths(&err),
            vec!["dependencies.required.org.example.base", "dependencies.required.org.example.deps"]
        );
    }

    #[test]
    fn test_dangerous_capabilities_blocked_outside_builtin() {
        for tier in [Tier::Official, Tier::Community] {
            for cap in ["dangerous:eval", "dangerous:dom"] {
                let mut raw = minimal("org.example.danger", "community");
                raw["capabilities"] = json!(["storage:local", cap]);

                let err = validator().validate(&raw, tier).unwrap_err();
                let errors = err.validation_errors();
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].stage, ValidationStage::Security);
                assert_eq!(errors[0].path, "capabilities[1]");
            }
        }

        let mut raw = minimal("org.itemdeck.devtools", "builtin");
        raw["capabilities"] = json!(["dangerous:eval"]);
        assert!(validator().validate(&raw, Tier::Builtin).is_ok());
    }

    #[test]
    fn test_community_collection_delete_blocked() {
        let mut raw = minimal("org.example.cleaner", "community");
        raw["capabilities"] = json!(["collection:delete"]);
        assert!(validator().validate(&raw, Tier::Community).is_err());
        assert!(validator().validate(&raw, Tier::Official).is_ok());
    }

    #[test]
    fn test_tier_claim_cannot_exceed_source() {
        let raw = minimal("org.example.liar", "official");
        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(paths(&err), vec!["itemdeck.tier"]);

        let humble = minimal("org.example.humble", "community");
        assert!(validator().validate(&humble, Tier::Official).is_ok());
    }

    #[test]
    fn test_content_policy_paths() {
        let mut raw = minimal("org.example.paths", "community");
        raw["assets"] = json!({ "icon": "../../etc/passwd.png", "banner": "banner.exe" });
        raw["entry"] = json!({ "main": "https://cdn.example.com/main.js", "styles": "ok.css" });

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(err.validation_errors()[0].stage, ValidationStage::Content);
        assert_eq!(paths(&err), vec!["assets.icon", "assets.banner", "entry.main"]);
    }

    #[test]
    fn test_inline_script_in_contributions() {
        let mut raw = minimal("org.example.xss", "community");
        raw["contributes"] = json!({
            "themes": [{ "id": "x", "template": "<div><script>steal()</script></div>" }]
        });

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(paths(&err), vec!["contributes.themes[0].template"]);
    }

    #[test]
    fn test_contributions_must_be_objects() {
        let mut raw = minimal("org.example.shape", "community");
        raw["contributes"] = json!({ "mechanics": ["memory"] });

        let err = validator().validate(&raw, Tier::Community).unwrap_err();
        assert_eq!(paths(&err), vec!["contributes.mechanics[0]"]);
    }

    #[test]
    fn test_validate_bytes_rejects_invalid_json() {
        let err = validator().validate_bytes(b"{ not json", Tier::Community).unwrap_err();
        assert_eq!(err.validation_errors()[0].stage, ValidationStage::Structural);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let raw = full();
        let ctx = ValidationContext::new(Tier::Community, Version::new(1, 2, 0));
        assert_eq!(validate(&raw, &ctx).unwrap(), validate(&raw, &ctx).unwrap());
    }

    #[test]
    fn test_parse_range_alternatives() {
        let range = parse_range("^1.0 || >=3.0.0").unwrap();
        assert!(range_matches(&range, &Version::new(1, 4, 0)));
        assert!(!range_matches(&range, &Version::new(2, 0, 0)));
        assert!(range_matches(&range, &Version::new(3, 1, 0)));
        assert!(parse_range("^1.0 ||").is_err());
    }
}
