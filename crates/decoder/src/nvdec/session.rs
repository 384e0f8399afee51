//! CUDA context, context lock and copy stream for one decoder.
//!
//! [`HardwareSession`] either creates its device context and CUVID context
//! lock or adopts handles injected by the application through
//! [`ExternalSession`]. Injected handles are never destroyed here.
//!
//! Every call into the decode engine must hold the context lock
//! ([`ContextLock::acquire`]); calls that need the CUDA context current on
//! the calling thread additionally push it ([`CurrentContext::push`]).
//! Both return RAII guards that release in reverse order of acquisition.

use std::ptr;
use std::sync::Arc;

use cudarc::driver::{sys, CudaContext};
use nvsync_common::{DecodeError, DecodeResult};
use tracing::{debug, error, info, warn};

use super::ffi::{check_cuvid_result, CUcontext, CUstream, CUvideoctxlock, NvcuvidLibrary};

fn driver_error(call: &'static str, e: cudarc::driver::DriverError) -> DecodeError {
    DecodeError::HardwareCallFailed {
        call,
        code: e.0 as i32,
    }
}

// ---------------------------------------------------------------------------
// External handles
// ---------------------------------------------------------------------------

/// Device context and context lock owned by the application.
#[derive(Copy, Clone, Debug)]
pub struct ExternalSession {
    pub context: CUcontext,
    /// `None` makes the session create its own lock on `context`.
    pub lock: Option<CUvideoctxlock>,
}

// SAFETY: The handles are opaque driver objects usable from any thread;
// the application guarantees they outlive the session.
unsafe impl Send for ExternalSession {}

// ---------------------------------------------------------------------------
// Context lock
// ---------------------------------------------------------------------------

/// Shared handle to the CUVID context lock.
#[derive(Clone)]
pub struct ContextLock {
    lib: Arc<NvcuvidLibrary>,
    handle: CUvideoctxlock,
}

// SAFETY: A CUVID context lock is a driver-side mutex meant to be taken
// from several threads.
unsafe impl Send for ContextLock {}
unsafe impl Sync for ContextLock {}

impl std::fmt::Debug for ContextLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLock")
            .field("handle", &format_args!("{:p}", self.handle))
            .finish()
    }
}

impl ContextLock {
    pub fn raw(&self) -> CUvideoctxlock {
        self.handle
    }

    pub fn acquire(&self) -> DecodeResult<CtxLockGuard<'_>> {
        // SAFETY: handle is a live lock from cuvidCtxLockCreate or the
        // application; flags must be 0.
        let result = unsafe { (self.lib.cuvidCtxLock)(self.handle, 0) };
        check_cuvid_result(result, "cuvidCtxLock")?;
        Ok(CtxLockGuard { lock: self })
    }
}

/// Held context lock; unlocks on drop.
pub struct CtxLockGuard<'a> {
    lock: &'a ContextLock,
}

impl Drop for CtxLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: The lock was taken by `acquire` on this thread.
        let result = unsafe { (self.lock.lib.cuvidCtxUnlock)(self.lock.handle, 0) };
        if result != 0 {
            warn!(error_code = result, "Failed to unlock CUDA context");
        }
    }
}

// ---------------------------------------------------------------------------
// Current context
// ---------------------------------------------------------------------------

/// A context that can be made current on the calling thread.
#[derive(Copy, Clone, Debug)]
pub struct CurrentContext(CUcontext);

// SAFETY: CUDA contexts may be pushed on any thread.
unsafe impl Send for CurrentContext {}
unsafe impl Sync for CurrentContext {}

impl CurrentContext {
    pub fn raw(&self) -> CUcontext {
        self.0
    }

    pub fn push(&self) -> DecodeResult<PushedContext> {
        // SAFETY: The context is alive for as long as the owning session.
        unsafe { sys::cuCtxPushCurrent_v2(self.0 as sys::CUcontext) }
            .result()
            .map_err(|e| driver_error("cuCtxPushCurrent", e))?;
        Ok(PushedContext { _not_send: std::marker::PhantomData })
    }
}

/// Pops the context pushed by [`CurrentContext::push`] on drop.
pub struct PushedContext {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for PushedContext {
    fn drop(&mut self) {
        let mut popped: sys::CUcontext = ptr::null_mut();
        // SAFETY: Balances the push made on this thread.
        if let Err(e) = unsafe { sys::cuCtxPopCurrent_v2(&mut popped) }.result() {
            warn!(error = ?e, "Failed to pop CUDA context");
        }
    }
}

// ---------------------------------------------------------------------------
// HardwareSession
// ---------------------------------------------------------------------------

enum DeviceContext {
    /// Created by this session; released when dropped.
    Owned(Arc<CudaContext>),
    External(CUcontext),
}

impl DeviceContext {
    fn raw(&self) -> CUcontext {
        match self {
            Self::Owned(ctx) => ctx.cu_ctx() as CUcontext,
            Self::External(ctx) => *ctx,
        }
    }
}

/// Device-level resources shared by the parser, the decoder instance and
/// the frame copies.
pub struct HardwareSession {
    lib: Arc<NvcuvidLibrary>,
    context: Option<DeviceContext>,
    lock: Option<ContextLock>,
    owns_lock: bool,
    stream: sys::CUstream,
}

// SAFETY: All handles are driver objects; use from the pipeline thread
// is serialized by the context lock.
unsafe impl Send for HardwareSession {}

impl std::fmt::Debug for HardwareSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSession")
            .field("owned_context", &matches!(self.context, Some(DeviceContext::Owned(_))))
            .field("owns_lock", &self.owns_lock)
            .field("open", &self.is_open())
            .finish()
    }
}

impl HardwareSession {
    /// Create or adopt the context, create the copy stream, then create or
    /// adopt the context lock.
    pub fn open(
        lib: Arc<NvcuvidLibrary>,
        device_ordinal: u32,
        external: Option<ExternalSession>,
    ) -> DecodeResult<Self> {
        let context = match external {
            Some(ext) => {
                debug!("Using provided CUDA context");
                DeviceContext::External(ext.context)
            }
            None => {
                let ctx = CudaContext::new(device_ordinal as usize)
                    .map_err(|e| driver_error("cuCtxCreate", e))?;
                info!(
                    device = device_ordinal,
                    name = %ctx.name().unwrap_or_else(|_| "Unknown NVIDIA GPU".to_string()),
                    "CUDA context created"
                );
                DeviceContext::Owned(ctx)
            }
        };

        let mut session = Self {
            lib: lib.clone(),
            context: Some(context),
            lock: None,
            owns_lock: false,
            stream: ptr::null_mut(),
        };

        {
            let _pushed = session.current_context()?.push()?;
            let mut stream: sys::CUstream = ptr::null_mut();
            // SAFETY: The session context is current; 0 is CU_STREAM_DEFAULT.
            unsafe { sys::cuStreamCreate(&mut stream, 0) }
                .result()
                .map_err(|e| driver_error("cuStreamCreate", e))?;
            session.stream = stream;
            debug!("Created CUDA copy stream");
        }

        match external.and_then(|ext| ext.lock) {
            Some(handle) => {
                debug!("Using provided context lock");
                session.lock = Some(ContextLock { lib, handle });
            }
            None => {
                let mut handle: CUvideoctxlock = ptr::null_mut();
                let ctx = session.current_context()?.raw();
                // SAFETY: ctx is a live context; the driver writes the new
                // lock handle.
                let result = unsafe { (lib.cuvidCtxLockCreate)(&mut handle, ctx) };
                check_cuvid_result(result, "cuvidCtxLockCreate")?;
                session.lock = Some(ContextLock { lib, handle });
                session.owns_lock = true;
                debug!("Created CUDA context lock");
            }
        }

        Ok(session)
    }

    pub fn is_open(&self) -> bool {
        self.context.is_some() && self.lock.is_some()
    }

    pub fn context_lock(&self) -> DecodeResult<ContextLock> {
        self.lock.clone().ok_or(DecodeError::SessionClosed)
    }

    pub fn current_context(&self) -> DecodeResult<CurrentContext> {
        self.context
            .as_ref()
            .map(|ctx| CurrentContext(ctx.raw()))
            .ok_or(DecodeError::SessionClosed)
    }

    pub fn stream(&self) -> CUstream {
        self.stream as CUstream
    }

    /// Wait for every copy queued on the session stream.
    pub fn synchronize(&self) -> DecodeResult<()> {
        // SAFETY: stream is live until close().
        unsafe { sys::cuStreamSynchronize(self.stream) }
            .result()
            .map_err(|e| driver_error("cuStreamSynchronize", e))
    }

    /// Forget every handle without destroying it. Used when a decoder
    /// that still references the lock and context could not be destroyed.
    pub fn leak(&mut self) {
        if let Some(DeviceContext::Owned(ctx)) = self.context.take() {
            std::mem::forget(ctx);
        }
        self.lock = None;
        self.owns_lock = false;
        self.stream = ptr::null_mut();
        warn!("Leaked CUDA context, context lock and stream");
    }

    /// Release the owned lock, the stream and the owned context, in that
    /// order. A handle whose destroy call fails is leaked rather than
    /// retried.
    pub fn close(&mut self) {
        if let Some(lock) = self.lock.take() {
            if self.owns_lock {
                debug!("Destroying CUDA context lock");
                // SAFETY: The lock was created by this session and no guard
                // is outstanding.
                let result = unsafe { (self.lib.cuvidCtxLockDestroy)(lock.handle) };
                if result != 0 {
                    error!(error_code = result, "Failed to destroy CUDA context lock");
                }
            }
            self.owns_lock = false;
        }

        if !self.stream.is_null() {
            debug!("Destroying CUDA stream");
            // SAFETY: stream was created in open() and is no longer used.
            if let Err(e) = unsafe { sys::cuStreamDestroy_v2(self.stream) }.result() {
                error!(error = ?e, "Failed to destroy CUDA stream");
            }
            self.stream = ptr::null_mut();
        }

        match self.context.take() {
            Some(DeviceContext::Owned(ctx)) => {
                debug!("Releasing CUDA context");
                drop(ctx);
            }
            Some(DeviceContext::External(_)) | None => {}
        }
    }
}

impl Drop for HardwareSession {
    fn drop(&mut self) {
        self.close();
    }
}
