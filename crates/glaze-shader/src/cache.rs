//! Two-level pipeline cache.
//!
//! Level one is keyed by shader-pairing identity: the first request for a
//! given (vertex source, fragment source) pair schedules a pipeline-base
//! build on a background worker and publishes a future; later requests for
//! the same pairing share that future. Level two lives inside each base:
//! a render-pass -> native-pipeline map filled synchronously by whichever
//! thread first draws with that pass.
//!
//! A failed build poisons its cache entry: every waiter re-raises the
//! original error and the pairing is never retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ash::vk;
use crossbeam::channel::{Receiver, Sender};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::compile::ShaderCompiler;
use crate::device::ShaderDevice;
use crate::pipeline::{build_pipeline_base, PipelineBase, PipelineDescriptor, RenderPassTarget};
use crate::spirv::reflect::BlockMember;
use crate::ShaderError;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Number of background build workers.
    pub worker_threads: usize,
    /// Device minimum uniform-buffer offset alignment, forwarded to the
    /// source normalizer.
    pub ubo_offset_alignment: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(4);
        CacheOptions { worker_threads: workers.max(1), ubo_offset_alignment: 256 }
    }
}

// ============================================================================
// Build future
// ============================================================================

enum BuildState {
    Pending,
    Ready(Arc<PipelineBase>),
    Failed(ShaderError),
}

/// Deferred result of a pipeline-base build. Publication uses the mutex for
/// release semantics, so a base observed through `wait` is fully built.
pub struct PipelineFuture {
    state: Mutex<BuildState>,
    ready: Condvar,
}

impl PipelineFuture {
    fn new() -> PipelineFuture {
        PipelineFuture { state: Mutex::new(BuildState::Pending), ready: Condvar::new() }
    }

    fn fulfill(&self, result: Result<PipelineBase, ShaderError>) {
        let mut state = self.state.lock();
        *state = match result {
            Ok(base) => BuildState::Ready(Arc::new(base)),
            Err(err) => BuildState::Failed(err),
        };
        self.ready.notify_all();
    }

    /// Block until the build completes or fails.
    pub fn wait(&self) -> Result<Arc<PipelineBase>, ShaderError> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                BuildState::Ready(base) => return Ok(base.clone()),
                BuildState::Failed(err) => return Err(err.clone()),
                BuildState::Pending => {}
            }
            self.ready.wait(&mut state);
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<Result<Arc<PipelineBase>, ShaderError>> {
        match &*self.state.lock() {
            BuildState::Pending => None,
            BuildState::Ready(base) => Some(Ok(base.clone())),
            BuildState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

struct BuildJob {
    descriptor: Arc<PipelineDescriptor>,
    future: Arc<PipelineFuture>,
}

// ============================================================================
// Cache
// ============================================================================

/// Owns the base cache, the worker pool, and the device handle used for
/// native object creation.
pub struct PipelineCache {
    device: Arc<dyn ShaderDevice>,
    bases: Mutex<HashMap<(String, String), Arc<PipelineFuture>>>,
    sender: Option<Sender<BuildJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineCache {
    pub fn new(device: Arc<dyn ShaderDevice>, options: CacheOptions) -> PipelineCache {
        let (sender, receiver) = crossbeam::channel::unbounded::<BuildJob>();
        let mut workers = Vec::with_capacity(options.worker_threads.max(1));
        for _ in 0..options.worker_threads.max(1) {
            let receiver = receiver.clone();
            let device = device.clone();
            let alignment = options.ubo_offset_alignment;
            workers.push(thread::spawn(move || worker_loop(receiver, device, alignment)));
        }
        PipelineCache { device, bases: Mutex::new(HashMap::new()), sender: Some(sender), workers }
    }

    /// Request the pipeline for a descriptor. The first request for a given
    /// source pairing schedules the build; the caller never blocks here.
    pub fn request(&self, descriptor: Arc<PipelineDescriptor>) -> CachedPipeline {
        let key = descriptor.cache_key();
        let mut bases = self.bases.lock();
        let future = match bases.get(&key) {
            Some(future) => future.clone(),
            None => {
                let future = Arc::new(PipelineFuture::new());
                bases.insert(key, future.clone());
                let job = BuildJob { descriptor: descriptor.clone(), future: future.clone() };
                let sent = match &self.sender {
                    Some(sender) => sender.send(job).is_ok(),
                    None => false,
                };
                if !sent {
                    future.fulfill(Err(ShaderError::Vulkan(
                        "pipeline cache is shut down".to_string(),
                    )));
                }
                future
            }
        };
        CachedPipeline { descriptor, future, device: self.device.clone() }
    }

    /// Number of cached base entries, including failed ones.
    pub fn base_count(&self) -> usize {
        self.bases.lock().len()
    }

    /// Close the build queue, join the workers, and destroy every cached
    /// base (variants first, then layouts, then modules).
    pub fn shutdown(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let mut bases = self.bases.lock();
        for (_, future) in bases.drain() {
            if let Some(Ok(base)) = future.try_get() {
                base.destroy(&*self.device);
            }
        }
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<BuildJob>, device: Arc<dyn ShaderDevice>, alignment: u32) {
    // One compiler context per worker; shaderc contexts are not safe for
    // concurrent invocation and are never shared.
    let compiler = match ShaderCompiler::new() {
        Ok(compiler) => Some(compiler),
        Err(err) => {
            error!("shader build worker has no compiler: {}", err);
            None
        }
    };
    while let Ok(job) = receiver.recv() {
        let result = match &compiler {
            Some(compiler) => {
                debug!("building pipeline base '{}'", job.descriptor.name);
                build_pipeline_base(compiler, &*device, &job.descriptor, alignment)
            }
            None => Err(ShaderError::Compile("no shader compiler available".to_string())),
        };
        if let Err(err) = &result {
            error!("pipeline '{}' build failed: {}", job.descriptor.name, err);
        }
        job.future.fulfill(result);
    }
}

// ============================================================================
// Cached pipeline handle
// ============================================================================

/// Public handle to one requested pipeline. Every accessor that needs the
/// concrete base converts async to sync at that point, never earlier.
#[derive(Clone)]
pub struct CachedPipeline {
    descriptor: Arc<PipelineDescriptor>,
    future: Arc<PipelineFuture>,
    device: Arc<dyn ShaderDevice>,
}

impl CachedPipeline {
    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }

    /// Block until the base is built; re-raises the build error if it failed.
    pub fn wait(&self) -> Result<Arc<PipelineBase>, ShaderError> {
        self.future.wait()
    }

    /// Non-blocking poll of the build result.
    pub fn try_get(&self) -> Option<Result<Arc<PipelineBase>, ShaderError>> {
        self.future.try_get()
    }

    pub fn pipeline_layout(&self) -> Result<vk::PipelineLayout, ShaderError> {
        Ok(self.wait()?.pipeline_layout())
    }

    pub fn descriptor_set_layouts(&self) -> Result<Vec<vk::DescriptorSetLayout>, ShaderError> {
        Ok(self.wait()?.descriptor_set_layouts().to_vec())
    }

    pub fn attribute_location(&self, name: &str) -> Result<Option<u32>, ShaderError> {
        Ok(self.wait()?.attribute_location(name))
    }

    pub fn push_constant_members(&self) -> Result<Vec<BlockMember>, ShaderError> {
        Ok(self.wait()?.push_constant_members().to_vec())
    }

    /// The native pipeline for a render pass, built on this thread if it is
    /// not cached yet.
    pub fn pipeline_for(&self, render_pass: &RenderPassTarget) -> Result<vk::Pipeline, ShaderError> {
        let base = self.wait()?;
        base.pipeline_for(
            &*self.device,
            &self.descriptor.vertex_format,
            &self.descriptor.state,
            render_pass,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::NullDevice;
    use crate::pipeline::BlendMode;
    use ash::vk::Handle;
    use std::sync::atomic::Ordering;

    const VERTEX: &str = "in vec3 Position;\nuniform mat4 ModelViewMat;\nout vec2 texCoord0;\nvoid main() {\n    texCoord0 = Position.xy;\n    gl_Position = ModelViewMat * vec4(Position, 1.0);\n}\n";
    const FRAGMENT: &str = "in vec2 texCoord0;\nuniform sampler2D Sampler0;\nout vec4 fragColor;\nvoid main() {\n    fragColor = texture(Sampler0, texCoord0);\n}\n";

    fn descriptor(name: &str) -> PipelineDescriptor {
        let mut descriptor = PipelineDescriptor::new(name, VERTEX, FRAGMENT);
        descriptor.uniforms = vec![crate::pipeline::UniformSpec::ubo_member("ModelViewMat")];
        descriptor.samplers = vec!["Sampler0".to_string()];
        descriptor
    }

    fn target(raw: u64) -> RenderPassTarget {
        RenderPassTarget {
            raw: vk::RenderPass::from_raw(raw),
            color_formats: vec![vk::Format::B8G8R8A8_UNORM],
            depth_format: Some(vk::Format::D32_SFLOAT),
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    // ============================================================
    // base sharing and variants
    // ============================================================

    #[test]
    fn test_identical_sources_share_one_base() {
        let device = Arc::new(NullDevice::default());
        let mut cache = PipelineCache::new(device.clone(), CacheOptions::default());

        // Same sources, different fixed-function state.
        let opaque = descriptor("terrain");
        let mut translucent = descriptor("terrain_translucent");
        translucent.state.blend = BlendMode::Alpha;
        translucent.state.depth_write = false;

        let first = cache.request(Arc::new(opaque));
        let second = cache.request(Arc::new(translucent));
        first.wait().unwrap();
        second.wait().unwrap();

        // One base: two shader modules total, compiled once.
        assert_eq!(cache.base_count(), 1);
        assert_eq!(device.modules_created.load(Ordering::Relaxed), 2);

        let pass_a = target(11);
        let pass_b = target(22);
        let p1 = first.pipeline_for(&pass_a).unwrap();
        let p2 = second.pipeline_for(&pass_b).unwrap();
        assert_ne!(p1, p2);

        // Re-requesting with the same pass returns the cached handle.
        let p3 = first.pipeline_for(&pass_a).unwrap();
        assert_eq!(p1, p3);
        assert_eq!(device.pipelines_created.load(Ordering::Relaxed), 2);

        cache.shutdown();
    }

    #[test]
    fn test_distinct_sources_get_distinct_bases() {
        let device = Arc::new(NullDevice::default());
        let mut cache = PipelineCache::new(device.clone(), CacheOptions::default());

        let first = cache.request(Arc::new(descriptor("terrain")));
        let other_fragment = FRAGMENT.replace("texture(Sampler0, texCoord0)", "vec4(texCoord0, 0.0, 1.0) + texture(Sampler0, texCoord0)");
        let mut changed = descriptor("terrain_tinted");
        changed.fragment_source = other_fragment;
        let second = cache.request(Arc::new(changed));

        first.wait().unwrap();
        second.wait().unwrap();
        assert_eq!(cache.base_count(), 2);
        assert_eq!(device.modules_created.load(Ordering::Relaxed), 4);

        cache.shutdown();
    }

    // ============================================================
    // failure propagation
    // ============================================================

    #[test]
    fn test_failed_build_poisons_entry() {
        let device = Arc::new(NullDevice::default());
        let mut cache = PipelineCache::new(device.clone(), CacheOptions::default());

        let mut broken = descriptor("broken");
        broken.fragment_source = "in vec2 texCoord0;\nvoid main() {\n    not valid glsl\n}\n".to_string();
        let handle = cache.request(Arc::new(broken.clone()));

        match handle.wait() {
            Err(ShaderError::Compile(msg)) => assert!(msg.contains("broken")),
            other => panic!("expected Compile error, got {:?}", other),
        }

        // A second request for the same pairing re-raises without a rebuild.
        let again = cache.request(Arc::new(broken));
        assert!(matches!(again.wait(), Err(ShaderError::Compile(_))));
        assert_eq!(cache.base_count(), 1);

        cache.shutdown();
    }

    #[test]
    fn test_undeclared_resource_fails_build() {
        let device = Arc::new(NullDevice::default());
        let mut cache = PipelineCache::new(device.clone(), CacheOptions::default());

        let mut undeclared = descriptor("no_contract");
        undeclared.samplers.clear();
        let handle = cache.request(Arc::new(undeclared));
        match handle.wait() {
            Err(ShaderError::UndeclaredResource(msg)) => {
                assert!(msg.contains("Sampler0"));
                assert!(msg.contains("no_contract"));
            }
            other => panic!("expected UndeclaredResource, got {:?}", other),
        }

        cache.shutdown();
    }

    // ============================================================
    // shutdown
    // ============================================================

    #[test]
    fn test_shutdown_destroys_everything_in_order() {
        let device = Arc::new(NullDevice::default());
        let mut cache = PipelineCache::new(device.clone(), CacheOptions::default());

        let handle = cache.request(Arc::new(descriptor("terrain")));
        handle.wait().unwrap();
        handle.pipeline_for(&target(7)).unwrap();

        cache.shutdown();
        assert_eq!(
            device.pipelines_created.load(Ordering::Relaxed),
            device.pipelines_destroyed.load(Ordering::Relaxed)
        );
        assert_eq!(
            device.pipeline_layouts_created.load(Ordering::Relaxed),
            device.pipeline_layouts_destroyed.load(Ordering::Relaxed)
        );
        assert_eq!(
            device.set_layouts_created.load(Ordering::Relaxed),
            device.set_layouts_destroyed.load(Ordering::Relaxed)
        );
        assert_eq!(
            device.modules_created.load(Ordering::Relaxed),
            device.modules_destroyed.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_layout_accessors_block_until_ready() {
        let device = Arc::new(NullDevice::default());
        let mut cache = PipelineCache::new(device.clone(), CacheOptions::default());

        let handle = cache.request(Arc::new(descriptor("terrain")));
        assert_ne!(handle.pipeline_layout().unwrap(), vk::PipelineLayout::null());
        assert_eq!(handle.descriptor_set_layouts().unwrap().len(), 1);
        assert_eq!(handle.attribute_location("Position").unwrap(), Some(0));

        cache.shutdown();
    }
}
