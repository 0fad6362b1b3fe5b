//! GLSL front end shared by the backends: parse, validate, emit SPIR-V.

use super::ShaderStage;
use crate::error::GpuError;
use crate::shader::ShaderSource;
use naga::back::spv;
use naga::front::glsl;
use naga::valid::{Capabilities, ValidationFlags, Validator};

pub const ENTRY_POINT: &str = "main";

impl From<ShaderStage> for naga::ShaderStage {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

/// Compiles a GLSL source into SPIR-V words.
pub fn compile_to_spirv(source: &ShaderSource) -> Result<Vec<u32>, GpuError> {
    let stage = naga::ShaderStage::from(source.stage);

    let module = glsl::Frontend::default()
        .parse(&glsl::Options::from(stage), &source.text)
        .map_err(|err| GpuError::Parse {
            name: source.name.clone(),
            message: err.to_string(),
        })?;

    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| GpuError::Validation {
            name: source.name.clone(),
            message: err.into_inner().to_string(),
        })?;

    let pipeline = spv::PipelineOptions {
        shader_stage: stage,
        entry_point: ENTRY_POINT.to_string(),
    };

    spv::write_vec(&module, &info, &spv::Options::default(), Some(&pipeline)).map_err(|err| {
        GpuError::Codegen {
            name: source.name.clone(),
            message: err.to_string(),
        }
    })
}
