//! Lookup of pipeline objects by the fixed function state they were built with.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use ash::vk;

/// How fragments are blended with the render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// No blending.
    Opaque,
    /// Blends by source alpha.
    Alpha,
    /// Adds source to destination.
    Additive,
    /// Multiplies source with destination.
    Multiply,
}

/// A vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    /// The binding number.
    pub binding: u32,
    /// Distance between two elements in bytes.
    pub stride: u32,
    /// Whether the binding advances per vertex or per instance.
    pub input_rate: vk::VertexInputRate,
}

/// A vertex attribute read from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// The shader input location.
    pub location: u32,
    /// The binding the attribute is read from.
    pub binding: u32,
    /// The attribute format.
    pub format: vk::Format,
    /// Offset inside an element in bytes.
    pub offset: u32,
}

/// The vertex input layout of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexInput {
    /// The vertex buffer bindings.
    pub bindings: Vec<VertexBinding>,
    /// The attributes of all bindings.
    pub attributes: Vec<VertexAttribute>,
}

/// Identifies a pipeline variant by its render pass and fixed function state.
///
/// The hash is computed once on creation. Equality compares every field, so two keys with
/// colliding hashes are still told apart.
#[derive(Debug, Clone)]
pub struct PipelineInstanceKey {
    render_pass: vk::RenderPass,
    vertex_input: Option<VertexInput>,
    topology: vk::PrimitiveTopology,
    cull_mode: vk::CullModeFlags,
    blend_mode: BlendMode,
    polygon_mode: vk::PolygonMode,
    hash: u64,
}

impl PipelineInstanceKey {
    /// Creates a key. Pass `None` as vertex input for pipelines without vertex buffers.
    pub fn new(
        render_pass: vk::RenderPass,
        vertex_input: Option<VertexInput>,
        topology: vk::PrimitiveTopology,
        cull_mode: vk::CullModeFlags,
        blend_mode: BlendMode,
        polygon_mode: vk::PolygonMode,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        render_pass.hash(&mut hasher);
        if let Some(vertex_input) = &vertex_input {
            vertex_input.hash(&mut hasher);
        }
        topology.hash(&mut hasher);
        cull_mode.hash(&mut hasher);
        blend_mode.hash(&mut hasher);
        polygon_mode.hash(&mut hasher);

        Self {
            render_pass,
            vertex_input,
            topology,
            cull_mode,
            blend_mode,
            polygon_mode,
            hash: hasher.finish(),
        }
    }

    /// The precomputed hash.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// The render pass the pipeline is compatible with.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// The vertex input layout, if any.
    pub fn vertex_input(&self) -> Option<&VertexInput> {
        self.vertex_input.as_ref()
    }

    /// The primitive topology.
    pub fn topology(&self) -> vk::PrimitiveTopology {
        self.topology
    }

    /// The cull mode.
    pub fn cull_mode(&self) -> vk::CullModeFlags {
        self.cull_mode
    }

    /// The blend mode.
    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    /// The polygon mode.
    pub fn polygon_mode(&self) -> vk::PolygonMode {
        self.polygon_mode
    }
}

impl PartialEq for PipelineInstanceKey {
    fn eq(&self, other: &Self) -> bool {
        self.render_pass == other.render_pass
            && self.vertex_input == other.vertex_input
            && self.topology == other.topology
            && self.cull_mode == other.cull_mode
            && self.blend_mode == other.blend_mode
            && self.polygon_mode == other.polygon_mode
    }
}

impl Eq for PipelineInstanceKey {}

impl Hash for PipelineInstanceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Pipelines of one shader, built on demand for each key.
#[derive(Debug)]
pub struct PipelineInstanceCache<P> {
    pipelines: HashMap<PipelineInstanceKey, P>,
}

impl<P> Default for PipelineInstanceCache<P> {
    fn default() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }
}

impl<P> PipelineInstanceCache<P> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pipeline built for `key`.
    pub fn get(&self, key: &PipelineInstanceKey) -> Option<&P> {
        self.pipelines.get(key)
    }

    /// Returns the pipeline built for `key`, builds and stores it first if there is none.
    ///
    /// Nothing is stored if `build` fails.
    pub fn get_or_try_insert_with<E, F>(&mut self, key: PipelineInstanceKey, build: F) -> Result<&P, E>
    where
        F: FnOnce(&PipelineInstanceKey) -> Result<P, E>,
    {
        match self.pipelines.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let pipeline = build(entry.key())?;
                Ok(entry.insert(pipeline))
            }
        }
    }

    /// Number of pipelines.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// True if no pipeline has been built yet.
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Removes and returns all pipelines so they can be destroyed.
    pub fn drain(&mut self) -> impl Iterator<Item = (PipelineInstanceKey, P)> + '_ {
        self.pipelines.drain()
    }
}
