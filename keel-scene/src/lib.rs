//! Serde data model for the glTF 2.0 subset the keel viewer consumes:
//! the JSON document tree, external `.bin` buffer loading, and
//! bounds-checked buffer-view slicing.
//!
//! Only what the viewer reads is modeled; unknown document fields are
//! ignored. Binary `.glb` containers, `data:` URIs, and sparse
//! accessors are not supported and fail with a [`LoadSceneError`]
//! where they would otherwise be reached.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

// ---- Document tree --------------------------------------------------

/// Root of a parsed document. Index fields throughout the tree refer
/// to positions in these arrays.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Index of the scene to display.
    pub scene: Option<usize>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub meshes: Vec<Mesh>,
    #[serde(default)]
    pub cameras: Vec<Camera>,
    #[serde(default)]
    pub materials: Vec<Material>,
    #[serde(default)]
    pub textures: Vec<Texture>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub accessors: Vec<Accessor>,
    #[serde(default)]
    pub buffer_views: Vec<BufferView>,
    #[serde(default)]
    pub buffers: Vec<Buffer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub nodes: Vec<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub children: Vec<usize>,
    pub mesh: Option<usize>,
    pub camera: Option<usize>,
    /// Column-major local transform. Mutually exclusive with the
    /// translation/rotation/scale fields.
    pub matrix: Option<[f32; 16]>,
    pub translation: Option<[f32; 3]>,
    /// Unit quaternion, `[x, y, z, w]`.
    pub rotation: Option<[f32; 4]>,
    pub scale: Option<[f32; 3]>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Mesh {
    #[serde(default)]
    pub primitives: Vec<Primitive>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Primitive {
    /// Attribute semantic ("POSITION", "NORMAL", ...) to accessor
    /// index.
    #[serde(default)]
    pub attributes: BTreeMap<String, usize>,
    pub indices: Option<usize>,
    pub material: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct Camera {
    #[serde(rename = "type")]
    pub kind: CameraKind,
    pub perspective: Option<PerspectiveCamera>,
    pub orthographic: Option<OrthographicCamera>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Perspective,
    Orthographic,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerspectiveCamera {
    /// Width over height. Absent means "use the viewport's".
    pub aspect_ratio: Option<f32>,
    /// Vertical field of view in radians.
    pub yfov: f32,
    pub znear: f32,
    /// Absent (or zero) means an infinite far plane.
    pub zfar: Option<f32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OrthographicCamera {
    pub xmag: f32,
    pub ymag: f32,
    pub znear: f32,
    pub zfar: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Material {
    pub pbr_metallic_roughness: Option<PbrMetallicRoughness>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbrMetallicRoughness {
    pub base_color_texture: Option<TextureRef>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TextureRef {
    pub index: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct Texture {
    /// Image index.
    pub source: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Image {
    pub uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accessor {
    pub buffer_view: Option<usize>,
    /// Offset into the buffer view, not the buffer.
    #[serde(default)]
    pub byte_offset: usize,
    pub component_type: ComponentType,
    /// Number of elements, not bytes.
    pub count: usize,
    #[serde(rename = "type")]
    pub kind: AccessorType,
}

impl Accessor {
    /// Size in bytes of one tightly packed element.
    pub fn element_size(&self) -> usize {
        self.component_type.size() * self.kind.component_count()
    }
}

/// Scalar component type of an accessor. The document carries these as
/// the format's numeric constants (5120..5126).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u32")]
pub enum ComponentType {
    Byte,
    UnsignedByte,
    Short,
    UnsignedShort,
    UnsignedInt,
    Float,
}

impl ComponentType {
    /// Size in bytes of one component.
    pub fn size(self) -> usize {
        match self {
            Self::Byte | Self::UnsignedByte => 1,
            Self::Short | Self::UnsignedShort => 2,
            Self::UnsignedInt | Self::Float => 4,
        }
    }
}

impl TryFrom<u32> for ComponentType {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            5120 => Ok(Self::Byte),
            5121 => Ok(Self::UnsignedByte),
            5122 => Ok(Self::Short),
            5123 => Ok(Self::UnsignedShort),
            5125 => Ok(Self::UnsignedInt),
            5126 => Ok(Self::Float),
            other => Err(format!("unknown accessor component type {other}")),
        }
    }
}

/// Element shape of an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessorType {
    Scalar,
    Vec2,
    Vec3,
    Vec4,
    Mat2,
    Mat3,
    Mat4,
}

impl AccessorType {
    pub fn component_count(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Vec2 => 2,
            Self::Vec3 => 3,
            Self::Vec4 => 4,
            Self::Mat2 => 4,
            Self::Mat3 => 9,
            Self::Mat4 => 16,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferView {
    pub buffer: usize,
    #[serde(default)]
    pub byte_offset: usize,
    pub byte_length: usize,
    /// Distance between elements for interleaved vertex data. Absent
    /// means tightly packed.
    pub byte_stride: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffer {
    pub uri: Option<String>,
    pub byte_length: usize,
}

// ---- Loading --------------------------------------------------------

#[derive(Debug, Error)]
pub enum LoadSceneError {
    #[error("Couldn't read scene document {path}: {source}")]
    ReadDocument {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Couldn't parse scene document {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Buffer {index} has no URI; embedded binary chunks are not supported")]
    MissingBufferUri { index: usize },
    #[error("Buffer {index} uses a data: URI, which is not supported")]
    DataUriUnsupported { index: usize },
    #[error("Couldn't read buffer file {path}: {source}")]
    ReadBuffer {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Buffer file {path} holds {actual} bytes but the document declares {expected}")]
    TruncatedBuffer {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum BufferViewError {
    #[error("Buffer view {index} does not exist")]
    InvalidBufferView { index: usize },
    #[error("Buffer view {view} refers to missing buffer {buffer}")]
    InvalidBuffer { view: usize, buffer: usize },
    #[error("Buffer view {view} covers bytes {offset}..{end} of a {buffer_len}-byte buffer")]
    OutOfBounds {
        view: usize,
        offset: usize,
        end: usize,
        buffer_len: usize,
    },
}

/// A parsed document plus the contents of its external buffers, in the
/// same order as [`Document::buffers`].
#[derive(Debug)]
pub struct LoadedDocument {
    pub document: Document,
    pub buffers: Vec<Vec<u8>>,
    /// Directory the document was read from. Image URIs resolve
    /// relative to this.
    pub base_dir: PathBuf,
}

impl LoadedDocument {
    /// Parses the document at `path` and reads every buffer it
    /// references, resolving URIs relative to the document's
    /// directory.
    pub fn load(path: &Path) -> Result<Self, LoadSceneError> {
        let bytes = std::fs::read(path).map_err(|source| LoadSceneError::ReadDocument {
            path: path.to_owned(),
            source,
        })?;
        let document: Document =
            serde_json::from_slice(&bytes).map_err(|source| LoadSceneError::Parse {
                path: path.to_owned(),
                source,
            })?;

        let base_dir = path.parent().unwrap_or(Path::new(".")).to_owned();

        let mut buffers = Vec::with_capacity(document.buffers.len());
        for (index, buffer) in document.buffers.iter().enumerate() {
            let uri = buffer
                .uri
                .as_deref()
                .ok_or(LoadSceneError::MissingBufferUri { index })?;
            let buffer_path = resolve_uri(&base_dir, uri)
                .ok_or(LoadSceneError::DataUriUnsupported { index })?;
            let contents =
                std::fs::read(&buffer_path).map_err(|source| LoadSceneError::ReadBuffer {
                    path: buffer_path.clone(),
                    source,
                })?;
            if contents.len() < buffer.byte_length {
                return Err(LoadSceneError::TruncatedBuffer {
                    path: buffer_path,
                    expected: buffer.byte_length,
                    actual: contents.len(),
                });
            }
            buffers.push(contents);
        }

        Ok(Self {
            document,
            buffers,
            base_dir,
        })
    }

    /// The bytes a buffer view covers, bounds-checked against the
    /// loaded buffer.
    pub fn buffer_view_bytes(&self, index: usize) -> Result<&[u8], BufferViewError> {
        let view = self
            .document
            .buffer_views
            .get(index)
            .ok_or(BufferViewError::InvalidBufferView { index })?;
        let buffer =
            self.buffers
                .get(view.buffer)
                .ok_or(BufferViewError::InvalidBuffer {
                    view: index,
                    buffer: view.buffer,
                })?;
        let end = view
            .byte_offset
            .checked_add(view.byte_length)
            .filter(|&end| end <= buffer.len())
            .ok_or(BufferViewError::OutOfBounds {
                view: index,
                offset: view.byte_offset,
                end: view.byte_offset.saturating_add(view.byte_length),
                buffer_len: buffer.len(),
            })?;
        Ok(&buffer[view.byte_offset..end])
    }
}

/// Resolves a buffer or image URI against the document directory.
/// Returns `None` for `data:` URIs.
pub fn resolve_uri(base_dir: &Path, uri: &str) -> Option<PathBuf> {
    if uri.starts_with("data:") {
        return None;
    }
    Some(base_dir.join(uri))
}

// ---- Tests ----------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Document {
        serde_json::from_str(json).expect("document should parse")
    }

    #[test]
    fn parses_nodes_with_matrix_and_trs_forms() {
        let doc = parse(
            r#"{
                "asset": { "version": "2.0", "generator": "test" },
                "scene": 0,
                "scenes": [{ "nodes": [0, 1] }],
                "nodes": [
                    { "matrix": [1,0,0,0, 0,1,0,0, 0,0,1,0, 5,6,7,1], "children": [1] },
                    { "translation": [1, 2, 3], "rotation": [0, 0, 0, 1], "scale": [2, 2, 2], "mesh": 0 }
                ]
            }"#,
        );

        assert_eq!(doc.scene, Some(0));
        assert_eq!(doc.scenes[0].nodes, vec![0, 1]);

        let matrix_node = &doc.nodes[0];
        let matrix = matrix_node.matrix.expect("matrix should be present");
        assert_eq!(matrix[12], 5.0);
        assert_eq!(matrix_node.children, vec![1]);
        assert!(matrix_node.mesh.is_none());

        let trs_node = &doc.nodes[1];
        assert!(trs_node.matrix.is_none());
        assert_eq!(trs_node.translation, Some([1.0, 2.0, 3.0]));
        assert_eq!(trs_node.rotation, Some([0.0, 0.0, 0.0, 1.0]));
        assert_eq!(trs_node.scale, Some([2.0, 2.0, 2.0]));
        assert_eq!(trs_node.mesh, Some(0));
    }

    #[test]
    fn parses_mesh_primitives_and_attribute_map() {
        let doc = parse(
            r#"{
                "meshes": [{
                    "primitives": [{
                        "attributes": { "POSITION": 0, "NORMAL": 1, "TEXCOORD_0": 2, "TANGENT": 3 },
                        "indices": 4,
                        "material": 0
                    }]
                }]
            }"#,
        );

        let primitive = &doc.meshes[0].primitives[0];
        assert_eq!(primitive.attributes["POSITION"], 0);
        assert_eq!(primitive.attributes["TANGENT"], 3);
        assert_eq!(primitive.indices, Some(4));
        assert_eq!(primitive.material, Some(0));
    }

    #[test]
    fn parses_cameras_of_both_kinds() {
        let doc = parse(
            r#"{
                "cameras": [
                    { "type": "perspective", "perspective": { "yfov": 0.7, "znear": 0.01 } },
                    { "type": "orthographic", "orthographic": { "xmag": 2.0, "ymag": 1.5, "znear": 0.1, "zfar": 100.0 } }
                ]
            }"#,
        );

        assert_eq!(doc.cameras[0].kind, CameraKind::Perspective);
        let perspective = doc.cameras[0].perspective.expect("perspective parameters");
        assert_eq!(perspective.yfov, 0.7);
        assert!(perspective.aspect_ratio.is_none());
        assert!(perspective.zfar.is_none());

        assert_eq!(doc.cameras[1].kind, CameraKind::Orthographic);
        let orthographic = doc.cameras[1]
            .orthographic
            .expect("orthographic parameters");
        assert_eq!(orthographic.xmag, 2.0);
        assert_eq!(orthographic.zfar, 100.0);
    }

    #[test]
    fn parses_material_base_color_chain() {
        let doc = parse(
            r#"{
                "materials": [
                    { "pbrMetallicRoughness": { "baseColorTexture": { "index": 1 } } },
                    {}
                ],
                "textures": [{ "source": 0 }, { "source": 1 }],
                "images": [{ "uri": "checker.png" }, {}]
            }"#,
        );

        let textured = doc.materials[0]
            .pbr_metallic_roughness
            .as_ref()
            .and_then(|pbr| pbr.base_color_texture.as_ref())
            .expect("base color texture");
        assert_eq!(textured.index, 1);
        assert!(doc.materials[1].pbr_metallic_roughness.is_none());

        assert_eq!(doc.textures[0].source, Some(0));
        assert_eq!(doc.images[0].uri.as_deref(), Some("checker.png"));
        assert!(doc.images[1].uri.is_none());
    }

    #[test]
    fn accessor_defaults_and_element_sizes() {
        let doc = parse(
            r#"{
                "accessors": [
                    { "bufferView": 0, "componentType": 5126, "count": 8, "type": "VEC3" },
                    { "bufferView": 1, "byteOffset": 256, "componentType": 5123, "count": 36, "type": "SCALAR" },
                    { "componentType": 5121, "count": 4, "type": "VEC2" }
                ]
            }"#,
        );

        let positions = &doc.accessors[0];
        assert_eq!(positions.byte_offset, 0);
        assert_eq!(positions.component_type, ComponentType::Float);
        assert_eq!(positions.kind, AccessorType::Vec3);
        assert_eq!(positions.element_size(), 12);

        let indices = &doc.accessors[1];
        assert_eq!(indices.byte_offset, 256);
        assert_eq!(indices.component_type, ComponentType::UnsignedShort);
        assert_eq!(indices.element_size(), 2);

        let texcoords = &doc.accessors[2];
        assert!(texcoords.buffer_view.is_none());
        assert_eq!(texcoords.element_size(), 2);
    }

    #[test]
    fn rejects_unknown_component_type() {
        let result: Result<Document, _> = serde_json::from_str(
            r#"{ "accessors": [{ "componentType": 5124, "count": 1, "type": "SCALAR" }] }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn buffer_view_slicing_is_bounds_checked() {
        let document = parse(
            r#"{
                "buffers": [{ "uri": "geometry.bin", "byteLength": 8 }],
                "bufferViews": [
                    { "buffer": 0, "byteOffset": 2, "byteLength": 4 },
                    { "buffer": 0, "byteOffset": 6, "byteLength": 4 },
                    { "buffer": 9, "byteLength": 1 }
                ]
            }"#,
        );
        let loaded = LoadedDocument {
            document,
            buffers: vec![vec![0, 1, 2, 3, 4, 5, 6, 7]],
            base_dir: PathBuf::from("."),
        };

        assert_eq!(
            loaded.buffer_view_bytes(0).expect("in-range view"),
            &[2, 3, 4, 5]
        );
        assert!(matches!(
            loaded.buffer_view_bytes(1),
            Err(BufferViewError::OutOfBounds { view: 1, .. })
        ));
        assert!(matches!(
            loaded.buffer_view_bytes(2),
            Err(BufferViewError::InvalidBuffer { view: 2, buffer: 9 })
        ));
        assert!(matches!(
            loaded.buffer_view_bytes(3),
            Err(BufferViewError::InvalidBufferView { index: 3 })
        ));
    }

    #[test]
    fn data_uris_are_rejected() {
        assert!(
            resolve_uri(
                Path::new("scenes"),
                "data:application/octet-stream;base64,AAAA"
            )
            .is_none()
        );
        assert_eq!(
            resolve_uri(Path::new("scenes"), "checker.png"),
            Some(PathBuf::from("scenes/checker.png"))
        );
    }
}
