use crate::gpu::Backend;
use crate::registry::Resource;

/// Trait for renderers driven by a [`crate::Sandbox`].
///
/// The sandbox calls [`recreate_pipeline`](Self::recreate_pipeline) on the
/// render thread whenever a newer program has been published, then
/// [`draw`](Self::draw) once per frame with the active program.
///
/// # Example
///
/// ```rust,no_run
/// use shader_sandbox::gpu::headless::{HeadlessBackend, HeadlessBuffer, HeadlessProgram};
/// use shader_sandbox::{HotReloadable, Resource};
///
/// #[derive(Default)]
/// struct Recorder {
///     pipelines: usize,
///     frames: usize,
/// }
///
/// impl HotReloadable<HeadlessBackend> for Recorder {
///     fn recreate_pipeline(
///         &mut self,
///         program: &Resource<HeadlessProgram>,
///     ) -> Result<(), Box<dyn std::error::Error>> {
///         println!("Recreating pipeline for {}", program.name);
///         self.pipelines += 1;
///         Ok(())
///     }
///
///     fn draw(
///         &mut self,
///         _program: &Resource<HeadlessProgram>,
///         _uniforms: &HeadlessBuffer,
///     ) -> Result<(), Box<dyn std::error::Error>> {
///         self.frames += 1;
///         Ok(())
///     }
/// }
/// ```
pub trait HotReloadable<G: Backend> {
    /// Rebuilds whatever depends on the program.
    ///
    /// Called without waiting for device idle; resources built for the
    /// previous program may still be in flight.
    fn recreate_pipeline(
        &mut self,
        program: &Resource<G::Program>,
    ) -> Result<(), Box<dyn std::error::Error>>;

    /// Records the full-screen draw reading the uniform block bound at
    /// [`crate::UNIFORM_BIND_POINT`].
    fn draw(
        &mut self,
        program: &Resource<G::Program>,
        uniforms: &G::Buffer,
    ) -> Result<(), Box<dyn std::error::Error>>;
}
