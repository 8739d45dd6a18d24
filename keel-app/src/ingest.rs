//! Turns a loaded scene document into GPU-ready draw state.
//!
//! Ingestion runs as two passes over the document. The first walks the
//! node graph, interleaves and packs vertex data, uploads geometry
//! through a [`GeometryStore`], and flattens every mesh primitive into
//! a [`DrawRecord`] with its composed global transform; it also
//! captures the first camera node it encounters. The second pass
//! resolves each draw's material chain down to an image URI and feeds a
//! [`TextureStore`], deduplicating texture uploads by URI.
//!
//! Geometry is deduplicated at upload: index buffers by the buffer view
//! they slice, vertex buffers by the exact tuple of source accessors.
//! Primitives that share sources share pool entries and differ only in
//! their draw parameters.

use std::collections::BTreeMap;
use std::path::Path;

use glam::{Mat4, Quat, Vec3};
use keel_scene::{
    Accessor, AccessorType, Camera, CameraKind, ComponentType,
    LoadedDocument, Node, Primitive,
};
use thiserror::Error;

use crate::vertex::{Vertex, pack_snorm_2_10_10_10};

/// Nodes nested deeper than this abort the walk. Real documents are a
/// handful of levels deep; a chain this long is a malformed file.
const MAX_NODE_DEPTH: usize = 256;

// ---- Errors ---------------------------------------------------------

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Scene index {scene} does not exist in the document")]
    InvalidScene { scene: usize },
    #[error("Node index {node} does not exist in the document")]
    InvalidNode { node: usize },
    #[error("Node graph is nested deeper than {limit} levels")]
    NodeGraphTooDeep { limit: usize },
    #[error("Mesh index {mesh} does not exist in the document")]
    InvalidMesh { mesh: usize },
    #[error("Camera index {camera} does not exist in the document")]
    InvalidCamera { camera: usize },
    #[error("Camera {camera} is missing the parameters for its projection kind")]
    CameraParametersMissing { camera: usize },
    #[error("Mesh {mesh} primitive {primitive} has no index accessor")]
    MissingIndices { mesh: usize, primitive: usize },
    #[error("Mesh {mesh} primitive {primitive} is missing the {semantic} attribute")]
    MissingAttribute {
        mesh: usize,
        primitive: usize,
        semantic: &'static str,
    },
    #[error("Accessor index {accessor} does not exist in the document")]
    InvalidAccessor { accessor: usize },
    #[error("Accessor {accessor} has no buffer view")]
    AccessorWithoutView { accessor: usize },
    #[error(
        "Index accessor {accessor} is {component_type:?} {kind:?}; only scalar unsigned 16-bit indices are supported"
    )]
    UnsupportedIndexType {
        accessor: usize,
        component_type: ComponentType,
        kind: AccessorType,
    },
    #[error("Index accessor {accessor} starts at odd byte offset {offset}")]
    MisalignedIndexOffset { accessor: usize, offset: usize },
    #[error("Accessor {accessor} has an unsupported format for the {semantic} attribute")]
    UnsupportedAttributeFormat {
        accessor: usize,
        semantic: &'static str,
    },
    #[error("Attribute {semantic} has {actual} elements but POSITION has {expected}")]
    MismatchedAttributeCounts {
        semantic: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error(
        "Buffer view {view} declares a {stride}-byte stride, smaller than its {element_size}-byte elements"
    )]
    StrideTooSmall {
        view: usize,
        stride: usize,
        element_size: usize,
    },
    #[error("Accessor {accessor} reads past the end of its buffer view")]
    AccessorOutOfBounds { accessor: usize },
    #[error(transparent)]
    View(#[from] keel_scene::BufferViewError),
    #[error("Draw {draw} references no material")]
    DrawWithoutMaterial { draw: usize },
    #[error("Material index {material} does not exist in the document")]
    InvalidMaterial { material: usize },
    #[error("Material {material} has no base color texture")]
    MaterialWithoutBaseColor { material: usize },
    #[error("Texture index {texture} does not exist in the document")]
    InvalidTexture { texture: usize },
    #[error("Texture {texture} has no source image")]
    TextureWithoutImage { texture: usize },
    #[error("Image index {image} does not exist in the document")]
    InvalidImage { image: usize },
    #[error("Image {image} has no URI to load from")]
    ImageWithoutUri { image: usize },
    #[error("Image {image} is embedded as a data: URI, which is not supported")]
    DataUriUnsupported { image: usize },
    #[error("Couldn't store scene resources: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

// ---- Output and store interfaces ------------------------------------

/// One recorded draw: everything the frame loop needs to issue a
/// single indexed draw call, in document order.
///
/// `vertex_buffer` and `index_buffer` are indices into the store's
/// static buffer pool. Draw order doubles as the immutable descriptor
/// set index, so draw `i` samples the texture bound for draw `i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawRecord {
    pub transform: Mat4,
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub vertex_buffer: usize,
    pub index_buffer: usize,
    pub material: Option<usize>,
}

/// What the geometry pass produced: the flattened draw list and the
/// clip-from-world transform of the first camera node encountered
/// (identity when the scene has none).
#[derive(Debug)]
pub struct IngestedScene {
    pub draws: Vec<DrawRecord>,
    pub camera_transform: Mat4,
}

/// Receives geometry blocks during the first ingestion pass.
///
/// The returned value is the store's pool index for the uploaded block;
/// [`DrawRecord`]s refer back to it. Vertex and index uploads share one
/// pool namespace.
pub trait GeometryStore {
    fn upload_vertices(&mut self, vertices: &[Vertex]) -> Result<usize, IngestError>;

    /// `data` is a whole index buffer view: little-endian unsigned
    /// 16-bit indices. A view is uploaded once no matter how many
    /// primitives slice into it.
    fn upload_indices(&mut self, data: &[u8]) -> Result<usize, IngestError>;
}

/// Receives texture work during the second ingestion pass.
pub trait TextureStore {
    /// Decode and upload the image file at `path`, returning its
    /// texture pool index.
    fn load_texture(&mut self, path: &Path) -> Result<usize, IngestError>;

    /// Point draw `draw_index`'s immutable binding at `texture`.
    fn bind_draw_texture(&mut self, draw_index: usize, texture: usize) -> Result<(), IngestError>;
}

// ---- Pass 1: geometry, transforms, camera ---------------------------

/// Walk the selected scene and upload its geometry.
///
/// `viewport_aspect` is the fallback aspect ratio for perspective
/// cameras that do not carry their own.
pub fn ingest_geometry(
    scene: &LoadedDocument,
    viewport_aspect: f32,
    geometry: &mut impl GeometryStore,
) -> Result<IngestedScene, IngestError> {
    let document = &scene.document;
    let scene_index = document.scene.unwrap_or(0);
    let mut pass = GeometryPass {
        scene,
        viewport_aspect,
        geometry,
        index_pool_by_view: BTreeMap::new(),
        vertex_pool_by_sources: BTreeMap::new(),
        draws: Vec::new(),
        camera_transform: None,
    };

    match document.scenes.get(scene_index) {
        Some(entry) => {
            for &root in &entry.nodes {
                pass.walk_node(root, Mat4::IDENTITY, 0)?;
            }
        }
        // A document with no scenes at all renders nothing, but an
        // explicit index pointing nowhere is malformed.
        None if document.scene.is_some() => {
            return Err(IngestError::InvalidScene { scene: scene_index });
        }
        None => {}
    }

    tracing::info!(
        "Scene ingested: {} draws, {} static uploads, camera {}",
        pass.draws.len(),
        pass.index_pool_by_view.len() + pass.vertex_pool_by_sources.len(),
        if pass.camera_transform.is_some() {
            "from document"
        } else {
            "identity"
        },
    );

    Ok(IngestedScene {
        draws: pass.draws,
        camera_transform: pass.camera_transform.unwrap_or(Mat4::IDENTITY),
    })
}

/// The accessors a primitive's vertex stream is gathered from. Used as
/// the vertex pool key: primitives naming the same four accessors share
/// one interleaved upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct VertexSources {
    position: usize,
    normal: usize,
    tex_coord: usize,
    tangent: usize,
}

struct GeometryPass<'a, G: GeometryStore> {
    scene: &'a LoadedDocument,
    viewport_aspect: f32,
    geometry: &'a mut G,
    index_pool_by_view: BTreeMap<usize, usize>,
    vertex_pool_by_sources: BTreeMap<VertexSources, usize>,
    draws: Vec<DrawRecord>,
    camera_transform: Option<Mat4>,
}

impl<G: GeometryStore> GeometryPass<'_, G> {
    fn walk_node(
        &mut self,
        node_index: usize,
        parent: Mat4,
        depth: usize,
    ) -> Result<(), IngestError> {
        if depth > MAX_NODE_DEPTH {
            return Err(IngestError::NodeGraphTooDeep {
                limit: MAX_NODE_DEPTH,
            });
        }
        let scene = self.scene;
        let node = scene
            .document
            .nodes
            .get(node_index)
            .ok_or(IngestError::InvalidNode { node: node_index })?;
        let global = parent * node_local_transform(node);

        if let Some(camera_index) = node.camera {
            // First camera in walk order wins; later ones are ignored.
            if self.camera_transform.is_none() {
                let camera = scene.document.cameras.get(camera_index).ok_or(
                    IngestError::InvalidCamera {
                        camera: camera_index,
                    },
                )?;
                let projection =
                    camera_projection(camera, camera_index, self.viewport_aspect)?;
                self.camera_transform = Some(projection * global.inverse());
            }
        }

        if let Some(mesh_index) = node.mesh {
            let mesh = scene.document.meshes.get(mesh_index).ok_or(
                IngestError::InvalidMesh { mesh: mesh_index },
            )?;
            for (primitive_index, primitive) in mesh.primitives.iter().enumerate() {
                self.load_primitive(mesh_index, primitive_index, primitive, global)?;
            }
        }

        for &child in &node.children {
            self.walk_node(child, global, depth + 1)?;
        }
        Ok(())
    }

    fn load_primitive(
        &mut self,
        mesh: usize,
        primitive_index: usize,
        primitive: &Primitive,
        transform: Mat4,
    ) -> Result<(), IngestError> {
        let index_accessor =
            primitive.indices.ok_or(IngestError::MissingIndices {
                mesh,
                primitive: primitive_index,
            })?;
        let (index_buffer, first_index, index_count) =
            self.load_index_range(index_accessor)?;

        let sources = vertex_sources(mesh, primitive_index, primitive)?;
        let vertex_buffer = match self.vertex_pool_by_sources.get(&sources) {
            Some(&pool_index) => pool_index,
            None => {
                let vertices = build_vertices(self.scene, sources)?;
                let pool_index = self.geometry.upload_vertices(&vertices)?;
                self.vertex_pool_by_sources.insert(sources, pool_index);
                pool_index
            }
        };

        self.draws.push(DrawRecord {
            transform,
            index_count,
            first_index,
            vertex_offset: 0,
            vertex_buffer,
            index_buffer,
            material: primitive.material,
        });
        Ok(())
    }

    /// Upload the accessor's whole buffer view (once per view) and
    /// return `(pool index, first index, index count)` for the draw.
    fn load_index_range(
        &mut self,
        accessor_index: usize,
    ) -> Result<(usize, u32, u32), IngestError> {
        let scene = self.scene;
        let accessor = scene.document.accessors.get(accessor_index).ok_or(
            IngestError::InvalidAccessor {
                accessor: accessor_index,
            },
        )?;
        if accessor.component_type != ComponentType::UnsignedShort
            || accessor.kind != AccessorType::Scalar
        {
            return Err(IngestError::UnsupportedIndexType {
                accessor: accessor_index,
                component_type: accessor.component_type,
                kind: accessor.kind,
            });
        }
        let view_index =
            accessor
                .buffer_view
                .ok_or(IngestError::AccessorWithoutView {
                    accessor: accessor_index,
                })?;
        let view_bytes = scene.buffer_view_bytes(view_index)?;

        if accessor.byte_offset % 2 != 0 {
            return Err(IngestError::MisalignedIndexOffset {
                accessor: accessor_index,
                offset: accessor.byte_offset,
            });
        }
        accessor
            .count
            .checked_mul(2)
            .and_then(|len| len.checked_add(accessor.byte_offset))
            .filter(|&end| end <= view_bytes.len())
            .ok_or(IngestError::AccessorOutOfBounds {
                accessor: accessor_index,
            })?;

        let pool_index = match self.index_pool_by_view.get(&view_index) {
            Some(&pool_index) => pool_index,
            None => {
                let pool_index = self.geometry.upload_indices(view_bytes)?;
                self.index_pool_by_view.insert(view_index, pool_index);
                pool_index
            }
        };
        Ok((
            pool_index,
            (accessor.byte_offset / 2) as u32,
            accessor.count as u32,
        ))
    }
}

fn vertex_sources(
    mesh: usize,
    primitive_index: usize,
    primitive: &Primitive,
) -> Result<VertexSources, IngestError> {
    let required = |semantic: &'static str| {
        primitive.attributes.get(semantic).copied().ok_or(
            IngestError::MissingAttribute {
                mesh,
                primitive: primitive_index,
                semantic,
            },
        )
    };
    Ok(VertexSources {
        position: required("POSITION")?,
        normal: required("NORMAL")?,
        tex_coord: required("TEXCOORD_0")?,
        tangent: required("TANGENT")?,
    })
}

/// Local transform: the explicit matrix when present, otherwise
/// translation * rotation * scale.
fn node_local_transform(node: &Node) -> Mat4 {
    if let Some(matrix) = node.matrix {
        Mat4::from_cols_array(&matrix)
    } else {
        let translation = Vec3::from(node.translation.unwrap_or([0.0; 3]));
        let rotation = node.rotation.map(Quat::from_array).unwrap_or(Quat::IDENTITY);
        let scale = Vec3::from(node.scale.unwrap_or([1.0; 3]));
        Mat4::from_scale_rotation_translation(scale, rotation, translation)
    }
}

/// The clip-from-view projection for a document camera. Right-handed,
/// depth 0..1. A perspective camera with no far plane (or a zero one)
/// gets an infinite projection.
fn camera_projection(
    camera: &Camera,
    camera_index: usize,
    viewport_aspect: f32,
) -> Result<Mat4, IngestError> {
    let missing = IngestError::CameraParametersMissing {
        camera: camera_index,
    };
    match camera.kind {
        CameraKind::Perspective => {
            let perspective = camera.perspective.ok_or(missing)?;
            let aspect = perspective.aspect_ratio.unwrap_or(viewport_aspect);
            Ok(match perspective.zfar {
                Some(zfar) if zfar > 0.0 => {
                    Mat4::perspective_rh(perspective.yfov, aspect, perspective.znear, zfar)
                }
                _ => Mat4::perspective_infinite_rh(
                    perspective.yfov,
                    aspect,
                    perspective.znear,
                ),
            })
        }
        CameraKind::Orthographic => {
            let orthographic = camera.orthographic.ok_or(missing)?;
            Ok(Mat4::orthographic_rh(
                0.0,
                2.0 * orthographic.xmag,
                0.0,
                2.0 * orthographic.ymag,
                orthographic.znear,
                orthographic.zfar,
            ))
        }
    }
}

// ---- Vertex gathering -----------------------------------------------

/// How texture coordinates are stored in the document. Integer forms
/// are normalized to [0, 1] on read.
#[derive(Debug, Clone, Copy)]
enum TexCoordFormat {
    Float,
    NormalizedU8,
    NormalizedU16,
}

/// Gather the four source accessors into interleaved [`Vertex`] form,
/// packing the tangent-space basis and deriving the bitangent from the
/// tangent's handedness component.
fn build_vertices(
    scene: &LoadedDocument,
    sources: VertexSources,
) -> Result<Vec<Vertex>, IngestError> {
    let position = AttributeReader::with_format(
        scene,
        sources.position,
        "POSITION",
        ComponentType::Float,
        AccessorType::Vec3,
    )?;
    let normal = AttributeReader::with_format(
        scene,
        sources.normal,
        "NORMAL",
        ComponentType::Float,
        AccessorType::Vec3,
    )?;
    let tangent = AttributeReader::with_format(
        scene,
        sources.tangent,
        "TANGENT",
        ComponentType::Float,
        AccessorType::Vec4,
    )?;

    let tex_coord_accessor = lookup_accessor(scene, sources.tex_coord)?;
    let tex_coord_format =
        match (tex_coord_accessor.component_type, tex_coord_accessor.kind) {
            (ComponentType::Float, AccessorType::Vec2) => TexCoordFormat::Float,
            (ComponentType::UnsignedByte, AccessorType::Vec2) => {
                TexCoordFormat::NormalizedU8
            }
            (ComponentType::UnsignedShort, AccessorType::Vec2) => {
                TexCoordFormat::NormalizedU16
            }
            _ => {
                return Err(IngestError::UnsupportedAttributeFormat {
                    accessor: sources.tex_coord,
                    semantic: "TEXCOORD_0",
                });
            }
        };
    let tex_coord = AttributeReader::new(scene, sources.tex_coord)?;

    // POSITION is authoritative for the vertex count.
    for (semantic, count) in [
        ("NORMAL", normal.count),
        ("TEXCOORD_0", tex_coord.count),
        ("TANGENT", tangent.count),
    ] {
        if count != position.count {
            return Err(IngestError::MismatchedAttributeCounts {
                semantic,
                expected: position.count,
                actual: count,
            });
        }
    }

    let mut vertices = Vec::with_capacity(position.count);
    for i in 0..position.count {
        let p = position.element(i);
        let n = vec3_at(normal.element(i));
        let t = tangent.element(i);
        let tangent3 = vec3_at(t);
        let handedness = read_f32(t, 12);
        let bitangent = n.cross(tangent3) * handedness;
        vertices.push(Vertex {
            position: [read_f32(p, 0), read_f32(p, 4), read_f32(p, 8)],
            basis: [
                pack_snorm_2_10_10_10(n),
                pack_snorm_2_10_10_10(tangent3),
                pack_snorm_2_10_10_10(bitangent),
            ],
            tex_coord: tex_coord_value(tex_coord.element(i), tex_coord_format),
        });
    }
    Ok(vertices)
}

fn tex_coord_value(element: &[u8], format: TexCoordFormat) -> [f32; 2] {
    match format {
        TexCoordFormat::Float => [read_f32(element, 0), read_f32(element, 4)],
        TexCoordFormat::NormalizedU8 => [
            f32::from(element[0]) / 255.0,
            f32::from(element[1]) / 255.0,
        ],
        TexCoordFormat::NormalizedU16 => [
            f32::from(read_u16(element, 0)) / 65535.0,
            f32::from(read_u16(element, 2)) / 65535.0,
        ],
    }
}

fn lookup_accessor(
    scene: &LoadedDocument,
    accessor_index: usize,
) -> Result<&Accessor, IngestError> {
    scene.document.accessors.get(accessor_index).ok_or(
        IngestError::InvalidAccessor {
            accessor: accessor_index,
        },
    )
}

/// Strided view over one accessor's elements, bounds-checked at
/// construction so per-element reads cannot run off the buffer.
struct AttributeReader<'a> {
    bytes: &'a [u8],
    stride: usize,
    element_size: usize,
    count: usize,
}

impl<'a> AttributeReader<'a> {
    fn new(
        scene: &'a LoadedDocument,
        accessor_index: usize,
    ) -> Result<Self, IngestError> {
        let accessor = lookup_accessor(scene, accessor_index)?;
        let view_index =
            accessor
                .buffer_view
                .ok_or(IngestError::AccessorWithoutView {
                    accessor: accessor_index,
                })?;
        let view_bytes = scene.buffer_view_bytes(view_index)?;
        let view = &scene.document.buffer_views[view_index];

        let element_size = accessor.element_size();
        let stride = view.byte_stride.unwrap_or(element_size);
        if stride < element_size {
            return Err(IngestError::StrideTooSmall {
                view: view_index,
                stride,
                element_size,
            });
        }

        let out_of_bounds = IngestError::AccessorOutOfBounds {
            accessor: accessor_index,
        };
        let needed = match accessor.count {
            0 => accessor.byte_offset,
            count => (count - 1)
                .checked_mul(stride)
                .and_then(|spread| spread.checked_add(accessor.byte_offset))
                .and_then(|last| last.checked_add(element_size))
                .ok_or(out_of_bounds)?,
        };
        if needed > view_bytes.len() {
            return Err(IngestError::AccessorOutOfBounds {
                accessor: accessor_index,
            });
        }

        Ok(Self {
            bytes: &view_bytes[accessor.byte_offset..],
            stride,
            element_size,
            count: accessor.count,
        })
    }

    fn with_format(
        scene: &'a LoadedDocument,
        accessor_index: usize,
        semantic: &'static str,
        component_type: ComponentType,
        kind: AccessorType,
    ) -> Result<Self, IngestError> {
        let accessor = lookup_accessor(scene, accessor_index)?;
        if accessor.component_type != component_type || accessor.kind != kind {
            return Err(IngestError::UnsupportedAttributeFormat {
                accessor: accessor_index,
                semantic,
            });
        }
        Self::new(scene, accessor_index)
    }

    fn element(&self, i: usize) -> &'a [u8] {
        let start = i * self.stride;
        &self.bytes[start..start + self.element_size]
    }
}

fn vec3_at(element: &[u8]) -> Vec3 {
    Vec3::new(read_f32(element, 0), read_f32(element, 4), read_f32(element, 8))
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    f32::from_le_bytes(word)
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

// ---- Pass 2: textures -----------------------------------------------

/// Resolve every draw's material to its base color image and feed the
/// texture store, uploading each distinct image URI exactly once.
///
/// Draw index doubles as the immutable descriptor set index, so binds
/// are issued in draw order.
pub fn ingest_textures(
    scene: &LoadedDocument,
    draws: &[DrawRecord],
    textures: &mut impl TextureStore,
) -> Result<(), IngestError> {
    let document = &scene.document;
    let mut pool_by_uri: BTreeMap<String, usize> = BTreeMap::new();

    for (draw_index, draw) in draws.iter().enumerate() {
        let material_index =
            draw.material.ok_or(IngestError::DrawWithoutMaterial {
                draw: draw_index,
            })?;
        let material = document.materials.get(material_index).ok_or(
            IngestError::InvalidMaterial {
                material: material_index,
            },
        )?;
        let base_color = material
            .pbr_metallic_roughness
            .as_ref()
            .and_then(|pbr| pbr.base_color_texture.as_ref())
            .ok_or(IngestError::MaterialWithoutBaseColor {
                material: material_index,
            })?;
        let texture = document.textures.get(base_color.index).ok_or(
            IngestError::InvalidTexture {
                texture: base_color.index,
            },
        )?;
        let image_index =
            texture.source.ok_or(IngestError::TextureWithoutImage {
                texture: base_color.index,
            })?;
        let image = document.images.get(image_index).ok_or(
            IngestError::InvalidImage { image: image_index },
        )?;
        let uri = image
            .uri
            .as_deref()
            .ok_or(IngestError::ImageWithoutUri { image: image_index })?;

        let pool_index = match pool_by_uri.get(uri) {
            Some(&pool_index) => pool_index,
            None => {
                let path = keel_scene::resolve_uri(&scene.base_dir, uri).ok_or(
                    IngestError::DataUriUnsupported { image: image_index },
                )?;
                tracing::debug!("Loading texture {}", path.display());
                let pool_index = textures.load_texture(&path)?;
                pool_by_uri.insert(uri.to_owned(), pool_index);
                pool_index
            }
        };
        textures.bind_draw_texture(draw_index, pool_index)?;
    }
    Ok(())
}

// ---- Tests ----------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keel_scene::{
        BufferView, Document, Image, Material, Mesh, PbrMetallicRoughness,
        PerspectiveCamera, Scene, Texture, TextureRef,
    };
    use std::path::PathBuf;

    // ---- Mock stores ----

    #[derive(Debug)]
    enum Upload {
        Vertices(Vec<Vertex>),
        Indices(Vec<u8>),
    }

    #[derive(Default)]
    struct RecordingGeometry {
        uploads: Vec<Upload>,
    }

    impl RecordingGeometry {
        fn vertices(&self, pool_index: usize) -> &[Vertex] {
            match &self.uploads[pool_index] {
                Upload::Vertices(vertices) => vertices,
                other => panic!("pool entry {pool_index} is {other:?}, expected vertices"),
            }
        }

        fn indices(&self, pool_index: usize) -> &[u8] {
            match &self.uploads[pool_index] {
                Upload::Indices(data) => data,
                other => panic!("pool entry {pool_index} is {other:?}, expected indices"),
            }
        }

        fn vertex_upload_count(&self) -> usize {
            self.uploads
                .iter()
                .filter(|u| matches!(u, Upload::Vertices(_)))
                .count()
        }

        fn index_upload_count(&self) -> usize {
            self.uploads
                .iter()
                .filter(|u| matches!(u, Upload::Indices(_)))
                .count()
        }
    }

    impl GeometryStore for RecordingGeometry {
        fn upload_vertices(&mut self, vertices: &[Vertex]) -> Result<usize, IngestError> {
            self.uploads.push(Upload::Vertices(vertices.to_vec()));
            Ok(self.uploads.len() - 1)
        }

        fn upload_indices(&mut self, data: &[u8]) -> Result<usize, IngestError> {
            self.uploads.push(Upload::Indices(data.to_vec()));
            Ok(self.uploads.len() - 1)
        }
    }

    #[derive(Default)]
    struct RecordingTextures {
        loads: Vec<PathBuf>,
        binds: Vec<(usize, usize)>,
    }

    impl TextureStore for RecordingTextures {
        fn load_texture(&mut self, path: &Path) -> Result<usize, IngestError> {
            self.loads.push(path.to_owned());
            Ok(self.loads.len() - 1)
        }

        fn bind_draw_texture(
            &mut self,
            draw_index: usize,
            texture: usize,
        ) -> Result<(), IngestError> {
            self.binds.push((draw_index, texture));
            Ok(())
        }
    }

    // ---- Document assembly ----

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn u16_bytes(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn accessor(
        view: usize,
        byte_offset: usize,
        component_type: ComponentType,
        kind: AccessorType,
        count: usize,
    ) -> Accessor {
        Accessor {
            buffer_view: Some(view),
            byte_offset,
            component_type,
            count,
            kind,
        }
    }

    fn attribute_map(
        position: usize,
        normal: usize,
        tex_coord: usize,
        tangent: usize,
    ) -> BTreeMap<String, usize> {
        BTreeMap::from([
            ("POSITION".to_owned(), position),
            ("NORMAL".to_owned(), normal),
            ("TEXCOORD_0".to_owned(), tex_coord),
            ("TANGENT".to_owned(), tangent),
        ])
    }

    /// A builder that appends each data block as its own tightly packed
    /// buffer view in a single buffer.
    #[derive(Default)]
    struct SceneBuilder {
        bytes: Vec<u8>,
        views: Vec<BufferView>,
    }

    impl SceneBuilder {
        fn add_view(&mut self, data: &[u8], byte_stride: Option<usize>) -> usize {
            let byte_offset = self.bytes.len();
            self.bytes.extend_from_slice(data);
            self.views.push(BufferView {
                buffer: 0,
                byte_offset,
                byte_length: data.len(),
                byte_stride,
            });
            self.views.len() - 1
        }

        fn finish(self, mut document: Document) -> LoadedDocument {
            document.buffer_views = self.views;
            LoadedDocument {
                document,
                buffers: vec![self.bytes],
                base_dir: PathBuf::from("scenes"),
            }
        }
    }

    /// One triangle with all four attributes in tight separate views:
    /// accessors 0..=3 are POSITION/NORMAL/TEXCOORD_0/TANGENT, 4 is the
    /// index accessor.
    fn triangle_scene() -> LoadedDocument {
        let mut builder = SceneBuilder::default();
        let positions = builder.add_view(
            &f32_bytes(&[
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0,
            ]),
            None,
        );
        let normals = builder.add_view(
            &f32_bytes(&[
                0.0, 0.0, 1.0, //
                0.0, 0.0, 1.0, //
                0.0, 0.0, 1.0,
            ]),
            None,
        );
        let tex_coords = builder.add_view(
            &f32_bytes(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0]),
            None,
        );
        let tangents = builder.add_view(
            &f32_bytes(&[
                1.0, 0.0, 0.0, 1.0, //
                1.0, 0.0, 0.0, 1.0, //
                1.0, 0.0, 0.0, 1.0,
            ]),
            None,
        );
        let indices = builder.add_view(&u16_bytes(&[0, 1, 2]), None);

        let document = Document {
            scene: Some(0),
            scenes: vec![Scene { nodes: vec![0] }],
            nodes: vec![Node {
                mesh: Some(0),
                ..Node::default()
            }],
            meshes: vec![Mesh {
                primitives: vec![Primitive {
                    attributes: attribute_map(0, 1, 2, 3),
                    indices: Some(4),
                    material: Some(0),
                }],
            }],
            materials: vec![Material {
                pbr_metallic_roughness: Some(PbrMetallicRoughness {
                    base_color_texture: Some(TextureRef { index: 0 }),
                }),
            }],
            textures: vec![Texture { source: Some(0) }],
            images: vec![Image {
                uri: Some("checker.png".to_owned()),
            }],
            accessors: vec![
                accessor(positions, 0, ComponentType::Float, AccessorType::Vec3, 3),
                accessor(normals, 0, ComponentType::Float, AccessorType::Vec3, 3),
                accessor(tex_coords, 0, ComponentType::Float, AccessorType::Vec2, 3),
                accessor(tangents, 0, ComponentType::Float, AccessorType::Vec4, 3),
                accessor(indices, 0, ComponentType::UnsignedShort, AccessorType::Scalar, 3),
            ],
            ..Document::default()
        };
        builder.finish(document)
    }

    fn ingest(scene: &LoadedDocument) -> (IngestedScene, RecordingGeometry) {
        let mut geometry = RecordingGeometry::default();
        let ingested = ingest_geometry(scene, 1.0, &mut geometry).unwrap();
        (ingested, geometry)
    }

    // ---- Pass 1 ----

    #[test]
    fn flattens_a_single_primitive() {
        let scene = triangle_scene();
        let (ingested, geometry) = ingest(&scene);

        assert_eq!(ingested.draws.len(), 1);
        let draw = ingested.draws[0];
        assert_eq!(draw.index_count, 3);
        assert_eq!(draw.first_index, 0);
        assert_eq!(draw.vertex_offset, 0);
        assert_eq!(draw.transform, Mat4::IDENTITY);
        assert_eq!(draw.material, Some(0));

        let vertices = geometry.vertices(draw.vertex_buffer);
        assert_eq!(vertices.len(), 3);
        assert_eq!(vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(vertices[2].tex_coord, [0.0, 1.0]);
        assert_eq!(geometry.indices(draw.index_buffer), u16_bytes(&[0, 1, 2]));
    }

    #[test]
    fn packs_the_tangent_space_basis() {
        let scene = triangle_scene();
        let (ingested, geometry) = ingest(&scene);
        let vertex = geometry.vertices(ingested.draws[0].vertex_buffer)[0];

        let normal = Vec3::Z;
        let tangent = Vec3::X;
        let bitangent = normal.cross(tangent);
        assert_eq!(vertex.basis[0], pack_snorm_2_10_10_10(normal));
        assert_eq!(vertex.basis[1], pack_snorm_2_10_10_10(tangent));
        assert_eq!(vertex.basis[2], pack_snorm_2_10_10_10(bitangent));
    }

    #[test]
    fn negative_handedness_flips_the_bitangent() {
        let mut scene = triangle_scene();
        let tangent_view = scene.document.accessors[3].buffer_view.unwrap();
        let view = &scene.document.buffer_views[tangent_view];
        let start = view.byte_offset;
        let flipped = f32_bytes(&[
            1.0, 0.0, 0.0, -1.0, //
            1.0, 0.0, 0.0, -1.0, //
            1.0, 0.0, 0.0, -1.0,
        ]);
        scene.buffers[0][start..start + flipped.len()].copy_from_slice(&flipped);

        let (ingested, geometry) = ingest(&scene);
        let vertex = geometry.vertices(ingested.draws[0].vertex_buffer)[0];
        assert_eq!(
            vertex.basis[2],
            pack_snorm_2_10_10_10(Vec3::Z.cross(Vec3::X) * -1.0)
        );
    }

    #[test]
    fn transforms_compose_parent_times_local() {
        let mut scene = triangle_scene();
        scene.document.nodes = vec![
            Node {
                children: vec![1],
                translation: Some([1.0, 2.0, 3.0]),
                ..Node::default()
            },
            Node {
                mesh: Some(0),
                scale: Some([2.0, 2.0, 2.0]),
                ..Node::default()
            },
        ];
        let (ingested, _) = ingest(&scene);

        let expected = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0))
            * Mat4::from_scale(Vec3::splat(2.0));
        assert!(ingested.draws[0].transform.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn explicit_matrix_overrides_trs() {
        let mut scene = triangle_scene();
        let matrix = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
        scene.document.nodes[0].matrix = Some(matrix.to_cols_array());
        // TRS fields are ignored when a matrix is present.
        scene.document.nodes[0].translation = Some([9.0, 9.0, 9.0]);

        let (ingested, _) = ingest(&scene);
        assert_eq!(ingested.draws[0].transform, matrix);
    }

    #[test]
    fn captures_the_first_camera_and_inverts_its_transform() {
        let mut scene = triangle_scene();
        scene.document.cameras = vec![Camera {
            kind: CameraKind::Perspective,
            perspective: Some(PerspectiveCamera {
                aspect_ratio: Some(2.0),
                yfov: 1.0,
                znear: 0.1,
                zfar: Some(100.0),
            }),
            orthographic: None,
        }];
        scene.document.nodes.push(Node {
            camera: Some(0),
            translation: Some([0.0, 0.0, 5.0]),
            ..Node::default()
        });
        scene.document.scenes[0].nodes = vec![1, 0];

        let (ingested, _) = ingest(&scene);
        let expected = Mat4::perspective_rh(1.0, 2.0, 0.1, 100.0)
            * Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0)).inverse();
        assert!(ingested.camera_transform.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn later_cameras_are_ignored() {
        let mut scene = triangle_scene();
        scene.document.cameras = vec![
            Camera {
                kind: CameraKind::Perspective,
                perspective: Some(PerspectiveCamera {
                    aspect_ratio: Some(1.0),
                    yfov: 1.0,
                    znear: 0.1,
                    zfar: None,
                }),
                orthographic: None,
            },
            Camera {
                kind: CameraKind::Orthographic,
                perspective: None,
                orthographic: Some(keel_scene::OrthographicCamera {
                    xmag: 1.0,
                    ymag: 1.0,
                    znear: 0.0,
                    zfar: 10.0,
                }),
            },
        ];
        scene.document.nodes.push(Node {
            camera: Some(0),
            ..Node::default()
        });
        scene.document.nodes.push(Node {
            camera: Some(1),
            ..Node::default()
        });
        scene.document.scenes[0].nodes = vec![1, 2, 0];

        let (ingested, _) = ingest(&scene);
        let expected = Mat4::perspective_infinite_rh(1.0, 1.0, 0.1);
        assert!(ingested.camera_transform.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn camera_aspect_falls_back_to_the_viewport() {
        let mut scene = triangle_scene();
        scene.document.cameras = vec![Camera {
            kind: CameraKind::Perspective,
            perspective: Some(PerspectiveCamera {
                aspect_ratio: None,
                yfov: 1.0,
                znear: 0.5,
                zfar: None,
            }),
            orthographic: None,
        }];
        scene.document.nodes.push(Node {
            camera: Some(0),
            ..Node::default()
        });
        scene.document.scenes[0].nodes = vec![1, 0];

        let mut geometry = RecordingGeometry::default();
        let ingested = ingest_geometry(&scene, 4.0 / 3.0, &mut geometry).unwrap();
        let expected = Mat4::perspective_infinite_rh(1.0, 4.0 / 3.0, 0.5);
        assert!(ingested.camera_transform.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn orthographic_cameras_project_the_magnified_box() {
        let mut scene = triangle_scene();
        scene.document.cameras = vec![Camera {
            kind: CameraKind::Orthographic,
            perspective: None,
            orthographic: Some(keel_scene::OrthographicCamera {
                xmag: 3.0,
                ymag: 2.0,
                znear: 1.0,
                zfar: 50.0,
            }),
        }];
        scene.document.nodes.push(Node {
            camera: Some(0),
            ..Node::default()
        });
        scene.document.scenes[0].nodes = vec![1, 0];

        let (ingested, _) = ingest(&scene);
        let expected = Mat4::orthographic_rh(0.0, 6.0, 0.0, 4.0, 1.0, 50.0);
        assert!(ingested.camera_transform.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn scenes_without_cameras_render_through_identity() {
        let scene = triangle_scene();
        let (ingested, _) = ingest(&scene);
        assert_eq!(ingested.camera_transform, Mat4::IDENTITY);
    }

    #[test]
    fn shared_index_views_upload_once() {
        let mut scene = triangle_scene();
        // Second primitive slices the same index view at element 1.
        let index_view = scene.document.accessors[4].buffer_view.unwrap();
        scene.document.accessors.push(accessor(
            index_view,
            2,
            ComponentType::UnsignedShort,
            AccessorType::Scalar,
            2,
        ));
        scene.document.meshes[0].primitives.push(Primitive {
            attributes: attribute_map(0, 1, 2, 3),
            indices: Some(5),
            material: Some(0),
        });

        let (ingested, geometry) = ingest(&scene);
        assert_eq!(ingested.draws.len(), 2);
        assert_eq!(geometry.index_upload_count(), 1);
        assert_eq!(
            ingested.draws[0].index_buffer,
            ingested.draws[1].index_buffer
        );
        assert_eq!(ingested.draws[0].first_index, 0);
        assert_eq!(ingested.draws[1].first_index, 1);
        assert_eq!(ingested.draws[1].index_count, 2);
    }

    #[test]
    fn shared_vertex_sources_upload_once() {
        let mut scene = triangle_scene();
        scene.document.meshes[0].primitives.push(Primitive {
            attributes: attribute_map(0, 1, 2, 3),
            indices: Some(4),
            material: Some(0),
        });

        let (ingested, geometry) = ingest(&scene);
        assert_eq!(geometry.vertex_upload_count(), 1);
        assert_eq!(
            ingested.draws[0].vertex_buffer,
            ingested.draws[1].vertex_buffer
        );
    }

    #[test]
    fn distinct_vertex_sources_upload_separately() {
        let mut scene = triangle_scene();
        // Same data, different texcoord accessor identity.
        let tex_view = scene.document.accessors[2].buffer_view.unwrap();
        scene.document.accessors.push(accessor(
            tex_view,
            0,
            ComponentType::Float,
            AccessorType::Vec2,
            3,
        ));
        scene.document.meshes[0].primitives.push(Primitive {
            attributes: attribute_map(0, 1, 5, 3),
            indices: Some(4),
            material: Some(0),
        });

        let (ingested, geometry) = ingest(&scene);
        assert_eq!(geometry.vertex_upload_count(), 2);
        assert_ne!(
            ingested.draws[0].vertex_buffer,
            ingested.draws[1].vertex_buffer
        );
    }

    #[test]
    fn first_index_derives_from_the_accessor_offset() {
        let mut builder = SceneBuilder::default();
        let positions =
            builder.add_view(&f32_bytes(&[0.0; 9]), None);
        let normals = builder.add_view(&f32_bytes(&[0.0; 9]), None);
        let tex_coords = builder.add_view(&f32_bytes(&[0.0; 6]), None);
        let tangents = builder.add_view(&f32_bytes(&[0.0; 12]), None);
        let indices = builder.add_view(&u16_bytes(&[9, 9, 9, 0, 1, 2]), None);

        let document = Document {
            scene: Some(0),
            scenes: vec![Scene { nodes: vec![0] }],
            nodes: vec![Node {
                mesh: Some(0),
                ..Node::default()
            }],
            meshes: vec![Mesh {
                primitives: vec![Primitive {
                    attributes: attribute_map(0, 1, 2, 3),
                    indices: Some(4),
                    material: None,
                }],
            }],
            accessors: vec![
                accessor(positions, 0, ComponentType::Float, AccessorType::Vec3, 3),
                accessor(normals, 0, ComponentType::Float, AccessorType::Vec3, 3),
                accessor(tex_coords, 0, ComponentType::Float, AccessorType::Vec2, 3),
                accessor(tangents, 0, ComponentType::Float, AccessorType::Vec4, 3),
                accessor(
                    indices,
                    6,
                    ComponentType::UnsignedShort,
                    AccessorType::Scalar,
                    3,
                ),
            ],
            ..Document::default()
        };
        let scene = builder.finish(document);

        let (ingested, geometry) = ingest(&scene);
        let draw = ingested.draws[0];
        assert_eq!(draw.first_index, 3);
        assert_eq!(draw.index_count, 3);
        // The whole view is uploaded, not just the accessor's slice.
        assert_eq!(
            geometry.indices(draw.index_buffer),
            u16_bytes(&[9, 9, 9, 0, 1, 2])
        );
    }

    #[test]
    fn interleaved_attributes_respect_the_view_stride() {
        let mut builder = SceneBuilder::default();
        // position (12 bytes) then texcoord (8 bytes) per vertex.
        let interleaved = builder.add_view(
            &f32_bytes(&[
                1.0, 2.0, 3.0, 0.1, 0.2, //
                4.0, 5.0, 6.0, 0.3, 0.4, //
                7.0, 8.0, 9.0, 0.5, 0.6,
            ]),
            Some(20),
        );
        let normals = builder.add_view(
            &f32_bytes(&[
                0.0, 0.0, 1.0, //
                0.0, 0.0, 1.0, //
                0.0, 0.0, 1.0,
            ]),
            None,
        );
        let tangents = builder.add_view(
            &f32_bytes(&[
                1.0, 0.0, 0.0, 1.0, //
                1.0, 0.0, 0.0, 1.0, //
                1.0, 0.0, 0.0, 1.0,
            ]),
            None,
        );
        let indices = builder.add_view(&u16_bytes(&[0, 1, 2]), None);

        let document = Document {
            scene: Some(0),
            scenes: vec![Scene { nodes: vec![0] }],
            nodes: vec![Node {
                mesh: Some(0),
                ..Node::default()
            }],
            meshes: vec![Mesh {
                primitives: vec![Primitive {
                    attributes: attribute_map(0, 2, 1, 3),
                    indices: Some(4),
                    material: None,
                }],
            }],
            accessors: vec![
                accessor(interleaved, 0, ComponentType::Float, AccessorType::Vec3, 3),
                accessor(interleaved, 12, ComponentType::Float, AccessorType::Vec2, 3),
                accessor(normals, 0, ComponentType::Float, AccessorType::Vec3, 3),
                accessor(tangents, 0, ComponentType::Float, AccessorType::Vec4, 3),
                accessor(
                    indices,
                    0,
                    ComponentType::UnsignedShort,
                    AccessorType::Scalar,
                    3,
                ),
            ],
            ..Document::default()
        };
        let scene = builder.finish(document);

        let (ingested, geometry) = ingest(&scene);
        let vertices = geometry.vertices(ingested.draws[0].vertex_buffer);
        assert_eq!(vertices[1].position, [4.0, 5.0, 6.0]);
        assert_eq!(vertices[1].tex_coord, [0.3, 0.4]);
        assert_eq!(vertices[2].position, [7.0, 8.0, 9.0]);
        assert_eq!(vertices[2].tex_coord, [0.5, 0.6]);
    }

    #[test]
    fn integer_tex_coords_normalize_to_unit_range() {
        let mut scene = triangle_scene();
        let append_view = |scene: &mut LoadedDocument, data: &[u8]| {
            let byte_offset = scene.buffers[0].len();
            scene.buffers[0].extend_from_slice(data);
            scene.document.buffer_views.push(BufferView {
                buffer: 0,
                byte_offset,
                byte_length: data.len(),
                byte_stride: None,
            });
            scene.document.buffer_views.len() - 1
        };
        let u16_view =
            append_view(&mut scene, &u16_bytes(&[0, 65535, 32767, 0, 0, 0]));
        let u8_view = append_view(&mut scene, &[0u8, 255, 128, 0, 0, 0]);

        // Primitive 0 reads u16 texcoords, a second primitive reads u8.
        scene.document.accessors[2] = accessor(
            u16_view,
            0,
            ComponentType::UnsignedShort,
            AccessorType::Vec2,
            3,
        );
        scene.document.accessors.push(accessor(
            u8_view,
            0,
            ComponentType::UnsignedByte,
            AccessorType::Vec2,
            3,
        ));
        scene.document.meshes[0].primitives.push(Primitive {
            attributes: attribute_map(0, 1, 5, 3),
            indices: Some(4),
            material: Some(0),
        });

        let (ingested, geometry) = ingest(&scene);
        let u16_vertices = geometry.vertices(ingested.draws[0].vertex_buffer);
        assert_eq!(u16_vertices[0].tex_coord, [0.0, 1.0]);
        assert_eq!(u16_vertices[1].tex_coord, [32767.0 / 65535.0, 0.0]);

        let u8_vertices = geometry.vertices(ingested.draws[1].vertex_buffer);
        assert_eq!(u8_vertices[0].tex_coord, [0.0, 1.0]);
        assert_eq!(u8_vertices[1].tex_coord, [128.0 / 255.0, 0.0]);
    }

    #[test]
    fn rejects_wide_index_types() {
        let mut scene = triangle_scene();
        scene.document.accessors[4].component_type = ComponentType::UnsignedInt;
        let mut geometry = RecordingGeometry::default();
        let error = ingest_geometry(&scene, 1.0, &mut geometry).unwrap_err();
        assert!(matches!(
            error,
            IngestError::UnsupportedIndexType { accessor: 4, .. }
        ));
    }

    #[test]
    fn rejects_missing_attributes() {
        let mut scene = triangle_scene();
        scene.document.meshes[0].primitives[0]
            .attributes
            .remove("TANGENT");
        let mut geometry = RecordingGeometry::default();
        let error = ingest_geometry(&scene, 1.0, &mut geometry).unwrap_err();
        assert!(matches!(
            error,
            IngestError::MissingAttribute {
                semantic: "TANGENT",
                ..
            }
        ));
    }

    #[test]
    fn rejects_mismatched_attribute_counts() {
        let mut scene = triangle_scene();
        scene.document.accessors[1].count = 2;
        let mut geometry = RecordingGeometry::default();
        let error = ingest_geometry(&scene, 1.0, &mut geometry).unwrap_err();
        assert!(matches!(
            error,
            IngestError::MismatchedAttributeCounts {
                semantic: "NORMAL",
                expected: 3,
                actual: 2,
            }
        ));
    }

    #[test]
    fn rejects_accessors_that_overrun_their_view() {
        let mut scene = triangle_scene();
        scene.document.accessors[0].count = 4;
        let mut geometry = RecordingGeometry::default();
        let error = ingest_geometry(&scene, 1.0, &mut geometry).unwrap_err();
        assert!(matches!(
            error,
            IngestError::AccessorOutOfBounds { accessor: 0 }
        ));
    }

    #[test]
    fn empty_documents_produce_no_draws() {
        let scene = LoadedDocument {
            document: Document::default(),
            buffers: Vec::new(),
            base_dir: PathBuf::from("."),
        };
        let (ingested, geometry) = ingest(&scene);
        assert!(ingested.draws.is_empty());
        assert_eq!(ingested.camera_transform, Mat4::IDENTITY);
        assert!(geometry.uploads.is_empty());
    }

    #[test]
    fn rejects_an_explicit_scene_index_that_does_not_exist() {
        let scene = LoadedDocument {
            document: Document {
                scene: Some(3),
                ..Document::default()
            },
            buffers: Vec::new(),
            base_dir: PathBuf::from("."),
        };
        let mut geometry = RecordingGeometry::default();
        let error = ingest_geometry(&scene, 1.0, &mut geometry).unwrap_err();
        assert!(matches!(error, IngestError::InvalidScene { scene: 3 }));
    }

    #[test]
    fn cyclic_node_graphs_hit_the_depth_limit() {
        let mut scene = triangle_scene();
        // A node that parents itself would otherwise recurse forever.
        scene.document.nodes[0].children = vec![0];
        let mut geometry = RecordingGeometry::default();
        let error = ingest_geometry(&scene, 1.0, &mut geometry).unwrap_err();
        assert!(matches!(error, IngestError::NodeGraphTooDeep { .. }));
    }

    // ---- Pass 2 ----

    fn draw_with_material(material: Option<usize>) -> DrawRecord {
        DrawRecord {
            transform: Mat4::IDENTITY,
            index_count: 3,
            first_index: 0,
            vertex_offset: 0,
            vertex_buffer: 0,
            index_buffer: 1,
            material,
        }
    }

    fn textured_document(image_uris: &[&str]) -> LoadedDocument {
        LoadedDocument {
            document: Document {
                materials: (0..image_uris.len())
                    .map(|i| Material {
                        pbr_metallic_roughness: Some(PbrMetallicRoughness {
                            base_color_texture: Some(TextureRef { index: i }),
                        }),
                    })
                    .collect(),
                textures: (0..image_uris.len())
                    .map(|i| Texture { source: Some(i) })
                    .collect(),
                images: image_uris
                    .iter()
                    .map(|uri| Image {
                        uri: Some((*uri).to_owned()),
                    })
                    .collect(),
                ..Document::default()
            },
            buffers: Vec::new(),
            base_dir: PathBuf::from("scenes"),
        }
    }

    #[test]
    fn shared_image_uris_upload_once_and_bind_everywhere() {
        let scene = textured_document(&["shared.png", "shared.png"]);
        let draws = [draw_with_material(Some(0)), draw_with_material(Some(1))];
        let mut textures = RecordingTextures::default();
        ingest_textures(&scene, &draws, &mut textures).unwrap();

        assert_eq!(textures.loads, vec![PathBuf::from("scenes/shared.png")]);
        assert_eq!(textures.binds, vec![(0, 0), (1, 0)]);
    }

    #[test]
    fn distinct_image_uris_upload_separately() {
        let scene = textured_document(&["a.png", "b.jpg"]);
        let draws = [draw_with_material(Some(0)), draw_with_material(Some(1))];
        let mut textures = RecordingTextures::default();
        ingest_textures(&scene, &draws, &mut textures).unwrap();

        assert_eq!(textures.loads.len(), 2);
        assert_eq!(textures.binds, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn rejects_draws_without_materials() {
        let scene = textured_document(&["a.png"]);
        let draws = [draw_with_material(None)];
        let mut textures = RecordingTextures::default();
        let error = ingest_textures(&scene, &draws, &mut textures).unwrap_err();
        assert!(matches!(error, IngestError::DrawWithoutMaterial { draw: 0 }));
    }

    #[test]
    fn rejects_materials_without_a_base_color_texture() {
        let mut scene = textured_document(&["a.png"]);
        scene.document.materials[0].pbr_metallic_roughness = None;
        let draws = [draw_with_material(Some(0))];
        let mut textures = RecordingTextures::default();
        let error = ingest_textures(&scene, &draws, &mut textures).unwrap_err();
        assert!(matches!(
            error,
            IngestError::MaterialWithoutBaseColor { material: 0 }
        ));
    }

    #[test]
    fn rejects_embedded_data_uris() {
        let scene =
            textured_document(&["data:image/png;base64,iVBORw0KGgo="]);
        let draws = [draw_with_material(Some(0))];
        let mut textures = RecordingTextures::default();
        let error = ingest_textures(&scene, &draws, &mut textures).unwrap_err();
        assert!(matches!(error, IngestError::DataUriUnsupported { image: 0 }));
    }
}
