//! Shader sources and the load/compile/publish steps run on worker threads.

use crate::error::SandboxError;
use crate::gpu::{Backend, ShaderStage};
use crate::hash::{Digest, hash_str};
use crate::registry::{BackendRegistry, Programs, Resource, Shaders};
use log::{debug, info, warn};
use std::path::Path;

/// The fragment shader the sandbox renders.
pub const MAIN_SHADER: &str = "main.glsl";

/// Names the sandbox reacts to. Texture and cube slots are filled by external
/// loaders.
pub const BUILTIN_NAMES: [&str; 9] = [
    MAIN_SHADER,
    "texture0",
    "texture1",
    "texture2",
    "texture3",
    "cube0",
    "cube1",
    "cube2",
    "cube3",
];

pub const DEFAULT_GLSL_VERSION: &str = "450";

/// Registry name of the full-screen vertex stage every program links against.
pub const FULLSCREEN_VERTEX_NAME: &str = "fullscreen.vert";

/// Emits one triangle covering the viewport from `gl_VertexIndex` alone.
pub const FULLSCREEN_VERTEX: &str = "#version 450
void main() {
    float x = float((gl_VertexIndex & 1) << 2) - 1.0;
    float y = float((gl_VertexIndex & 2) << 1) - 1.0;
    gl_Position = vec4(x, y, 0.0, 1.0);
}
";

pub fn is_builtin_name(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

/// Deduces the stage from the file extension. Unknown extensions are treated
/// as fragment shaders.
pub fn deduce_stage(name: &str) -> ShaderStage {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    match extension {
        "vert" | "vs" => ShaderStage::Vertex,
        "frag" | "fs" | "glsl" => ShaderStage::Fragment,
        _ => {
            warn!("Cannot deduce shader stage of {name}, assuming fragment");
            ShaderStage::Fragment
        }
    }
}

/// GLSL text ready for compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub name: String,
    pub stage: ShaderStage,
    pub text: String,
}

impl ShaderSource {
    /// Wraps `text`, adding a `#version` directive when it has none.
    pub fn new(name: impl Into<String>, stage: ShaderStage, text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.contains("#version") {
            text.insert_str(0, &format!("#version {DEFAULT_GLSL_VERSION}\n"));
        }
        Self {
            name: name.into(),
            stage,
            text,
        }
    }

    /// Reads `path`, naming the source after its file name.
    pub fn load(path: &Path) -> Result<Self, SandboxError> {
        let text = std::fs::read_to_string(path).map_err(|source| SandboxError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stage = deduce_stage(&name);
        Ok(Self::new(name, stage, text))
    }

    pub fn content_hash(&self) -> Digest {
        hash_str(&self.text)
    }
}

/// Loads and compiles the shader at `path` and publishes it.
///
/// Returns `Ok(None)` when the registry already holds this exact source;
/// nothing is compiled in that case.
pub fn load_shader_resource<G: Backend>(
    backend: &G,
    context: &mut G::Context,
    registry: &BackendRegistry<G>,
    path: &Path,
) -> Result<Option<Resource<G::Shader>>, SandboxError> {
    let shader = compile_if_changed(backend, context, registry, path)?;
    if let Some(shader) = &shader {
        registry.add::<Shaders>(shader.clone());
    }
    Ok(shader)
}

fn compile_if_changed<G: Backend>(
    backend: &G,
    context: &mut G::Context,
    registry: &BackendRegistry<G>,
    path: &Path,
) -> Result<Option<Resource<G::Shader>>, SandboxError> {
    let source = ShaderSource::load(path)?;
    let name_hash = hash_str(&source.name);
    let hash = source.content_hash();

    if registry.exists::<Shaders>(name_hash, hash) {
        debug!("[Shader] Leaving early, {} is unchanged ({hash})", source.name);
        return Ok(None);
    }

    let shader = backend.compile_shader(context, &source)?;
    Ok(Some(Resource::new(source.name, hash, shader)))
}

fn fullscreen_vertex<G: Backend>(
    backend: &G,
    context: &mut G::Context,
    registry: &BackendRegistry<G>,
) -> Result<Resource<G::Shader>, SandboxError> {
    if let Some(vertex) = registry.get_by_name::<Shaders>(FULLSCREEN_VERTEX_NAME) {
        return Ok(vertex);
    }

    let source = ShaderSource::new(FULLSCREEN_VERTEX_NAME, ShaderStage::Vertex, FULLSCREEN_VERTEX);
    let shader = backend.compile_shader(context, &source)?;
    let resource = Resource::new(FULLSCREEN_VERTEX_NAME, source.content_hash(), shader);
    registry.add::<Shaders>(resource.clone());
    Ok(resource)
}

/// Links `fragment` with the full-screen vertex stage and publishes the
/// program under the fragment's name and content hash.
pub fn rebuild_program<G: Backend>(
    backend: &G,
    context: &mut G::Context,
    registry: &BackendRegistry<G>,
    fragment: &Resource<G::Shader>,
) -> Result<Resource<G::Program>, SandboxError> {
    let vertex = fullscreen_vertex(backend, context, registry)?;
    let program = backend.link_program(
        context,
        &fragment.name,
        &[&*vertex.artifact, &*fragment.artifact],
    )?;

    let resource = Resource::new(fragment.name.clone(), fragment.hash, program);
    registry.add::<Programs>(resource.clone());
    Ok(resource)
}

/// Full reload of one shader file: load, compile, link, publish.
///
/// The shader is published only once its program links, so a source that
/// failed to link is compiled again on the next save.
pub fn reload_shader<G: Backend>(
    backend: &G,
    context: &mut G::Context,
    registry: &BackendRegistry<G>,
    path: &Path,
) -> Result<Option<Resource<G::Program>>, SandboxError> {
    let Some(shader) = compile_if_changed(backend, context, registry, path)? else {
        return Ok(None);
    };
    let program = rebuild_program(backend, context, registry, &shader)?;
    registry.add::<Shaders>(shader);
    info!("Program {} published ({})", program.name, program.hash);
    Ok(Some(program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use crate::gpu::headless::{HeadlessBackend, HeadlessContext};
    use crate::pool::WorkerInfo;
    use crate::registry::ResourceRegistry;

    const RED: &str = "layout(location = 0) out vec4 fragColor;
void main() { fragColor = vec4(1.0, 0.0, 0.0, 1.0); }
";
    const BLUE: &str = "#version 450
layout(location = 0) out vec4 fragColor;
void main() { fragColor = vec4(0.0, 0.0, 1.0, 1.0); }
";

    fn context(backend: &HeadlessBackend) -> HeadlessContext {
        backend
            .create_context(&WorkerInfo {
                index: 0,
                name: "threadpool#0".into(),
            })
            .unwrap()
    }

    #[test]
    fn version_directive_is_added_once() {
        let source = ShaderSource::new("main.glsl", ShaderStage::Fragment, RED);
        assert!(source.text.starts_with("#version 450\n"));

        let source = ShaderSource::new("main.glsl", ShaderStage::Fragment, BLUE);
        assert_eq!(source.text, BLUE);
    }

    #[test]
    fn stage_follows_extension() {
        assert_eq!(deduce_stage("main.glsl"), ShaderStage::Fragment);
        assert_eq!(deduce_stage("quad.vert"), ShaderStage::Vertex);
        assert_eq!(deduce_stage("quad.vs"), ShaderStage::Vertex);
        assert_eq!(deduce_stage("post.fs"), ShaderStage::Fragment);
        assert_eq!(deduce_stage("noext"), ShaderStage::Fragment);
    }

    #[test]
    fn builtin_names() {
        assert!(is_builtin_name("main.glsl"));
        assert!(is_builtin_name("cube3"));
        assert!(!is_builtin_name("texture4"));
        assert!(!is_builtin_name("other.glsl"));
    }

    #[test]
    fn identical_save_leaves_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MAIN_SHADER);
        let backend = HeadlessBackend::new();
        let mut context = context(&backend);
        let registry: BackendRegistry<HeadlessBackend> = ResourceRegistry::new();

        std::fs::write(&path, RED).unwrap();
        let first = load_shader_resource(&backend, &mut context, &registry, &path).unwrap();
        assert!(first.is_some());
        assert_eq!(backend.compiled_shaders(), 1);

        std::fs::write(&path, RED).unwrap();
        let second = load_shader_resource(&backend, &mut context, &registry, &path).unwrap();
        assert!(second.is_none());
        assert_eq!(backend.compiled_shaders(), 1);

        std::fs::write(&path, BLUE).unwrap();
        let third = load_shader_resource(&backend, &mut context, &registry, &path)
            .unwrap()
            .unwrap();
        assert_eq!(third.hash, hash_str(BLUE));
        assert_eq!(backend.compiled_shaders(), 2);
    }

    #[test]
    fn reload_publishes_program_under_fragment_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MAIN_SHADER);
        std::fs::write(&path, BLUE).unwrap();

        let backend = HeadlessBackend::new();
        let mut context = context(&backend);
        let registry: BackendRegistry<HeadlessBackend> = ResourceRegistry::new();

        let program = reload_shader(&backend, &mut context, &registry, &path)
            .unwrap()
            .unwrap();
        assert_eq!(program.name, MAIN_SHADER);
        assert_eq!(program.hash, hash_str(BLUE));
        assert_eq!(program.artifact.linked_by, "threadpool#0");

        let published = registry.get_by_name::<Programs>(MAIN_SHADER).unwrap();
        assert_eq!(published.hash, program.hash);
        // fragment plus the shared vertex stage
        assert_eq!(registry.len::<Shaders>(), 2);
    }

    #[test]
    fn compile_failure_keeps_previous_program() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MAIN_SHADER);
        let backend = HeadlessBackend::new();
        let mut context = context(&backend);
        let registry: BackendRegistry<HeadlessBackend> = ResourceRegistry::new();

        std::fs::write(&path, BLUE).unwrap();
        reload_shader(&backend, &mut context, &registry, &path).unwrap();

        std::fs::write(&path, "void main( {").unwrap();
        let err = reload_shader(&backend, &mut context, &registry, &path).unwrap_err();
        assert!(matches!(err, SandboxError::Gpu(_)));

        let published = registry.get_by_name::<Programs>(MAIN_SHADER).unwrap();
        assert_eq!(published.hash, hash_str(BLUE));
    }

    #[test]
    fn link_failure_is_retried_on_identical_save() {
        let dir = tempfile::tempdir().unwrap();
        // a lone vertex stage links against the full-screen vertex and fails
        let path = dir.path().join("quad.vert");
        std::fs::write(&path, FULLSCREEN_VERTEX).unwrap();
        let backend = HeadlessBackend::new();
        let mut context = context(&backend);
        let registry: BackendRegistry<HeadlessBackend> = ResourceRegistry::new();

        for attempt in 1..=2 {
            let err = reload_shader(&backend, &mut context, &registry, &path).unwrap_err();
            assert!(matches!(err, SandboxError::Gpu(GpuError::Link { .. })), "unexpected {err:?}");
            // quad.vert each time, the shared vertex stage once
            assert_eq!(backend.compiled_shaders(), attempt + 1);
        }
        assert!(registry.get_by_name::<Shaders>("quad.vert").is_none());
        assert!(registry.get_by_name::<Programs>("quad.vert").is_none());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = HeadlessBackend::new();
        let mut context = context(&backend);
        let registry: BackendRegistry<HeadlessBackend> = ResourceRegistry::new();

        let err = load_shader_resource(&backend, &mut context, &registry, &dir.path().join("nope.glsl"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Io { .. }));
    }
}
