//! Archive manifest documents.
//!
//! Every archive carries a `manifest.json` listing its content items. Items are
//! parsed once into `ManifestItem`, a typed view with explicit optional fields,
//! while the untouched JSON document is kept next to it so it can be persisted
//! exactly as received.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;

use super::record::{Visibility, COLLECTION_MIME_TYPE};

/// File name of the manifest at the root of every archive
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Identifier written into exported manifests
pub const ARCHIVE_ID: &str = "ekstep.content.archive";

/// Manifest version written into exported manifests
pub const CURRENT_MANIFEST_VERSION: &str = "1.1";

/// Status marking content that is still being authored
const DRAFT_STATUS: &str = "Draft";

/// Object type of library containers
const LIBRARY_OBJECT_TYPE: &str = "Library";

/// Errors raised while reading a manifest document
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest item {index} is invalid: {reason}")]
    InvalidItem { index: usize, reason: String },
}

/// How an item's artifact is packaged inside the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Gzip,
    Identity,
    #[serde(other)]
    Unknown,
}

/// Where an item's artifact lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentDisposition {
    Inline,
    Online,
    Attachment,
    #[serde(other)]
    Unknown,
}

/// What the materializer has to do to make an artifact available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactMode {
    /// Unpack the artifact archive into the item directory
    Extract,

    /// Copy the artifact byte-for-byte into the item directory
    Copy,

    /// Streamed from the network, nothing to place locally
    Online,

    /// Disposition/encoding combination this device cannot handle
    Unsupported,
}

/// A string field that may also be sent as a list of strings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) if s.is_empty() => Vec::new(),
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<StringOrList>::deserialize(deserializer)?
        .map(StringOrList::into_vec)
        .unwrap_or_default())
}

fn package_version<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => Ok(Some(n)),
        Some(NumberOrText::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid pkgVersion: {}", s))),
    }
}

fn visibility<'de, D>(deserializer: D) -> Result<Option<Visibility>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(s) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match s.parse() {
        Ok(visibility) => Ok(Some(visibility)),
        Err(_) => {
            warn!(visibility = %s, "Unknown visibility, treating as Default");
            Ok(Some(Visibility::Default))
        }
    }
}

/// Identifiers name a storage directory, so they must be a single plain
/// path component
pub fn is_plain_identifier(identifier: &str) -> bool {
    let mut components = Path::new(identifier).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name == OsStr::new(identifier),
        _ => false,
    }
}

/// Archive-relative path made of plain components only
///
/// `None` when the path is empty or could leave the directory it is joined
/// onto (`..`, absolute or prefixed components).
pub fn archive_relative_path(relative: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Reference to a child item inside `children`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChildRef {
    pub identifier: String,
}

/// Typed view of one manifest item
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub identifier: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub mime_type: Option<String>,

    #[serde(default)]
    pub content_encoding: Option<ContentEncoding>,

    #[serde(default)]
    pub content_disposition: Option<ContentDisposition>,

    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default, deserialize_with = "visibility")]
    pub visibility: Option<Visibility>,

    #[serde(default)]
    pub object_type: Option<String>,

    #[serde(default, deserialize_with = "string_list")]
    pub audience: Vec<String>,

    #[serde(default, deserialize_with = "string_list")]
    pub pragma: Vec<String>,

    #[serde(default)]
    pub compatibility_level: Option<u32>,

    #[serde(default, deserialize_with = "package_version")]
    pub pkg_version: Option<f64>,

    #[serde(default)]
    pub artifact_url: Option<String>,

    #[serde(default)]
    pub app_icon: Option<String>,

    #[serde(default, deserialize_with = "string_list")]
    pub board: Vec<String>,

    #[serde(default, deserialize_with = "string_list")]
    pub medium: Vec<String>,

    #[serde(default, deserialize_with = "string_list")]
    pub grade_level: Vec<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub child_nodes: Vec<String>,

    #[serde(default)]
    pub children: Vec<ChildRef>,

    /// The item document exactly as received
    #[serde(skip)]
    pub raw: Value,
}

impl ManifestItem {
    /// Parse one item document, keeping the raw JSON
    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let mut item: ManifestItem = serde_json::from_value(raw.clone())?;
        item.raw = raw;
        Ok(item)
    }

    /// Declared visibility, `Default` when absent
    pub fn visibility(&self) -> Visibility {
        self.visibility.unwrap_or(Visibility::Default)
    }

    pub fn mime_type(&self) -> &str {
        self.mime_type.as_deref().unwrap_or_default()
    }

    /// Lowercased content type
    pub fn content_type(&self) -> String {
        self.content_type
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
    }

    pub fn is_collection(&self) -> bool {
        self.mime_type() == COLLECTION_MIME_TYPE
    }

    /// Units are collections nested inside a parent; they aggregate children
    /// and never get a storage directory of their own.
    pub fn is_unit(&self) -> bool {
        self.is_collection() && self.visibility() == Visibility::Parent
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_unit()
    }

    pub fn is_draft(&self) -> bool {
        self.status.as_deref() == Some(DRAFT_STATUS)
    }

    /// Library objects are always containers
    pub fn is_library_object(&self) -> bool {
        self.object_type.as_deref() == Some(LIBRARY_OBJECT_TYPE)
    }

    /// Producer compatibility level, 1 when absent
    pub fn compatibility_level(&self) -> u32 {
        self.compatibility_level.unwrap_or(1)
    }

    pub fn audience(&self) -> String {
        if self.audience.is_empty() {
            "Learner".to_string()
        } else {
            self.audience.join(",")
        }
    }

    pub fn pragma(&self) -> String {
        self.pragma.join(",")
    }

    /// Decide how the declared artifact should be placed
    pub fn artifact_mode(&self) -> ArtifactMode {
        match (self.content_disposition, self.content_encoding) {
            (Some(ContentDisposition::Online), _) => ArtifactMode::Online,
            (None, _) | (_, None) => ArtifactMode::Extract,
            (Some(ContentDisposition::Inline), Some(ContentEncoding::Gzip)) => ArtifactMode::Extract,
            (Some(ContentDisposition::Inline), Some(ContentEncoding::Identity)) => ArtifactMode::Copy,
            _ => ArtifactMode::Unsupported,
        }
    }

    /// Direct children, from `children` and `childNodes`, without duplicates
    pub fn child_identifiers(&self) -> Vec<String> {
        child_identifiers_of(&self.raw)
    }
}

/// Direct child identifiers declared in an item document
pub fn child_identifiers_of(doc: &Value) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();

    let from_children = doc
        .get("children")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("identifier").and_then(Value::as_str));
    let from_nodes = doc
        .get("childNodes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);

    for id in from_children.chain(from_nodes) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }

    ids
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    id: Option<String>,
    ver: String,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    archive: RawArchive,
}

#[derive(Debug, Deserialize)]
struct RawArchive {
    #[serde(default)]
    ttl: Option<u32>,
    #[serde(default)]
    items: Vec<Value>,
}

/// A parsed archive manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    pub id: String,

    /// Manifest format version (`ver`)
    pub version: String,

    pub ts: Option<String>,
    pub params: Option<Value>,
    pub ttl: Option<u32>,

    /// Items in manifest order
    pub items: Vec<ManifestItem>,
}

impl Manifest {
    /// Parse a manifest document
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_slice(bytes)?;

        let items = raw
            .archive
            .items
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let item = ManifestItem::from_value(value).map_err(|e| ManifestError::InvalidItem {
                    index,
                    reason: e.to_string(),
                })?;
                if !is_plain_identifier(&item.identifier) {
                    return Err(ManifestError::InvalidItem {
                        index,
                        reason: format!("identifier {:?} is not a plain name", item.identifier),
                    });
                }
                Ok(item)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: raw.id.unwrap_or_else(|| ARCHIVE_ID.to_string()),
            version: raw.ver,
            ts: raw.ts,
            params: raw.params,
            ttl: raw.archive.ttl,
            items,
        })
    }

    /// Build a manifest for export from raw item documents
    pub fn for_export(items: Vec<Value>) -> Result<Self, ManifestError> {
        let items = items
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                ManifestItem::from_value(value).map_err(|e| ManifestError::InvalidItem {
                    index,
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: ARCHIVE_ID.to_string(),
            version: CURRENT_MANIFEST_VERSION.to_string(),
            ts: Some(chrono::Utc::now().to_rfc3339()),
            params: Some(json!({ "resmsgid": uuid::Uuid::new_v4().to_string() })),
            ttl: Some(24),
            items,
        })
    }

    /// First item declared with `Default` visibility
    pub fn root(&self) -> Option<&ManifestItem> {
        self.items
            .iter()
            .find(|item| item.visibility() == Visibility::Default)
    }

    /// Render the manifest document with the raw item documents
    pub fn to_document(&self) -> Value {
        let mut archive = Map::new();
        archive.insert("count".to_string(), json!(self.items.len()));
        if let Some(ttl) = self.ttl {
            archive.insert("ttl".to_string(), json!(ttl));
        }
        archive.insert(
            "items".to_string(),
            Value::Array(self.items.iter().map(|i| i.raw.clone()).collect()),
        );

        let mut doc = Map::new();
        doc.insert("id".to_string(), json!(self.id));
        doc.insert("ver".to_string(), json!(self.version));
        if let Some(ts) = &self.ts {
            doc.insert("ts".to_string(), json!(ts));
        }
        if let Some(params) = &self.params {
            doc.insert("params".to_string(), params.clone());
        }
        doc.insert("archive".to_string(), Value::Object(archive));

        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json(items: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": ARCHIVE_ID,
            "ver": "1.1",
            "archive": { "count": 1, "ttl": 24, "items": items }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_typed_fields() {
        let bytes = manifest_json(json!([{
            "identifier": "do_1",
            "mimeType": "application/pdf",
            "contentEncoding": "identity",
            "contentDisposition": "inline",
            "contentType": "Resource",
            "visibility": "Default",
            "audience": ["Learner", "Instructor"],
            "pragma": "external",
            "pkgVersion": "3",
            "gradeLevel": ["Class 1"],
            "artifactUrl": "do_1/book.pdf",
            "someVendorField": { "kept": true }
        }]));

        let manifest = Manifest::parse(&bytes).unwrap();
        assert_eq!(manifest.version, "1.1");
        let item = &manifest.items[0];
        assert_eq!(item.identifier, "do_1");
        assert_eq!(item.content_type(), "resource");
        assert_eq!(item.audience(), "Learner,Instructor");
        assert_eq!(item.pragma(), "external");
        assert_eq!(item.pkg_version, Some(3.0));
        assert_eq!(item.grade_level, vec!["Class 1"]);
        assert_eq!(item.artifact_mode(), ArtifactMode::Copy);
        assert_eq!(item.raw["someVendorField"]["kept"], json!(true));
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let bytes = manifest_json(json!([{ "identifier": "do_1" }]));
        let item = Manifest::parse(&bytes).unwrap().items.remove(0);

        assert_eq!(item.visibility(), Visibility::Default);
        assert_eq!(item.compatibility_level(), 1);
        assert_eq!(item.audience(), "Learner");
        assert_eq!(item.artifact_mode(), ArtifactMode::Extract);
        assert!(item.is_leaf());
    }

    #[test]
    fn test_item_without_identifier_is_rejected() {
        let bytes = manifest_json(json!([{ "identifier": "do_1" }, { "name": "nameless" }]));
        match Manifest::parse(&bytes) {
            Err(ManifestError::InvalidItem { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected invalid item, got {:?}", other),
        }
    }

    #[test]
    fn test_identifiers_must_be_plain_names() {
        for bad in ["", "..", ".", "../escaped", "do_1/../../x", "/abs", "a/b", "do_1/"] {
            let bytes = manifest_json(json!([{ "identifier": bad }]));
            assert!(
                matches!(Manifest::parse(&bytes), Err(ManifestError::InvalidItem { index: 0, .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(is_plain_identifier("do_1131687689003827201"));
    }

    #[test]
    fn test_archive_relative_paths() {
        assert_eq!(
            archive_relative_path("/do_1/./icon.png"),
            Some(PathBuf::from("do_1/icon.png"))
        );
        assert_eq!(archive_relative_path("do_1/do_1.zip"), Some(PathBuf::from("do_1/do_1.zip")));
        assert_eq!(archive_relative_path("../../etc/passwd"), None);
        assert_eq!(archive_relative_path("do_1/../../out.png"), None);
        assert_eq!(archive_relative_path(""), None);
        assert_eq!(archive_relative_path("/"), None);
    }

    #[test]
    fn test_unknown_visibility_falls_back_to_default() {
        let item = ManifestItem::from_value(json!({ "identifier": "do_1", "visibility": "Private" }))
            .unwrap();
        assert_eq!(item.visibility, Some(Visibility::Default));
    }

    #[test]
    fn test_unit_classification() {
        let unit = ManifestItem::from_value(json!({
            "identifier": "do_unit",
            "mimeType": COLLECTION_MIME_TYPE,
            "visibility": "Parent"
        }))
        .unwrap();
        assert!(unit.is_unit());

        let root_collection = ManifestItem::from_value(json!({
            "identifier": "do_book",
            "mimeType": COLLECTION_MIME_TYPE,
            "visibility": "Default"
        }))
        .unwrap();
        assert!(root_collection.is_leaf());
        assert!(root_collection.is_collection());
    }

    #[test]
    fn test_artifact_modes() {
        let mode = |disposition: &str, encoding: &str| {
            ManifestItem::from_value(json!({
                "identifier": "x",
                "contentDisposition": disposition,
                "contentEncoding": encoding
            }))
            .unwrap()
            .artifact_mode()
        };

        assert_eq!(mode("inline", "gzip"), ArtifactMode::Extract);
        assert_eq!(mode("inline", "identity"), ArtifactMode::Copy);
        assert_eq!(mode("online", "identity"), ArtifactMode::Online);
        assert_eq!(mode("attachment", "gzip"), ArtifactMode::Unsupported);
    }

    #[test]
    fn test_child_identifiers_merge_and_dedupe() {
        let item = ManifestItem::from_value(json!({
            "identifier": "do_book",
            "children": [{ "identifier": "do_a" }, { "identifier": "do_b" }],
            "childNodes": ["do_b", "do_c"]
        }))
        .unwrap();

        assert_eq!(item.child_identifiers(), vec!["do_a", "do_b", "do_c"]);
    }

    #[test]
    fn test_export_document_shape() {
        let manifest =
            Manifest::for_export(vec![json!({ "identifier": "do_1" }), json!({ "identifier": "do_2" })])
                .unwrap();
        let doc = manifest.to_document();

        assert_eq!(doc["id"], json!(ARCHIVE_ID));
        assert_eq!(doc["ver"], json!(CURRENT_MANIFEST_VERSION));
        assert_eq!(doc["archive"]["count"], json!(2));
        assert_eq!(doc["archive"]["items"][1]["identifier"], json!("do_2"));
        assert!(doc["params"]["resmsgid"].is_string());
    }
}
