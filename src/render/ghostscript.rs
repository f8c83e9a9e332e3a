//! Render engine backed by the Ghostscript shared library
//!
//! Frames arrive through the display device. The device announces its
//! buffer while the session starts, before any sink is installed, so the
//! last announced frame is remembered and replayed to each run's sink.

use std::ffi::CString;
use std::path::Path;
use std::ptr;

use libc::{c_char, c_int, c_uint, c_ulong, c_ushort, c_void};
use log::{debug, warn};

use super::buffer::NativeBuffer;
use super::engine::{
    CALLBACK_ABORT, CallbackResult, DisplayCallback, EngineCode, EngineParam, FrameGeometry,
    PixelFormat, RenderEngine,
};

const ARG_ENCODING_UTF8: c_int = 1;
/// Returned by `gsapi_init_with_args` when `-dBATCH` ends the session.
const E_QUIT: c_int = -101;
const INVALID_ARGUMENT: EngineCode = -15;

const SPT_BOOL: c_int = 1;
const SPT_INT: c_int = 2;
const SPT_FLOAT: c_int = 3;
const SPT_STRING: c_int = 5;
const SPT_PARSED: c_int = 9;

mod ffi {
    use super::{c_char, c_int, c_uint, c_ulong, c_ushort, c_void};

    type Handler = unsafe extern "C" fn(handle: *mut c_void, device: *mut c_void) -> c_int;

    /// `display_callback` as declared by `gdevdsp.h`, version 2.
    #[repr(C)]
    pub struct DisplayCallbackV2 {
        pub size: c_int,
        pub version_major: c_int,
        pub version_minor: c_int,
        pub display_open: Option<Handler>,
        pub display_preclose: Option<Handler>,
        pub display_close: Option<Handler>,
        pub display_presize: Option<
            unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, c_int, c_int, c_uint) -> c_int,
        >,
        pub display_size: Option<
            unsafe extern "C" fn(
                *mut c_void,
                *mut c_void,
                c_int,
                c_int,
                c_int,
                c_uint,
                *mut u8,
            ) -> c_int,
        >,
        pub display_sync: Option<Handler>,
        pub display_page:
            Option<unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, c_int) -> c_int>,
        pub display_update: Option<
            unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, c_int, c_int, c_int) -> c_int,
        >,
        pub display_memalloc:
            Option<unsafe extern "C" fn(*mut c_void, *mut c_void, c_ulong) -> *mut c_void>,
        pub display_memfree:
            Option<unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> c_int>,
        pub display_separation: Option<
            unsafe extern "C" fn(
                *mut c_void,
                *mut c_void,
                c_int,
                *const c_char,
                c_ushort,
                c_ushort,
                c_ushort,
                c_ushort,
            ) -> c_int,
        >,
    }

    #[link(name = "gs")]
    unsafe extern "C" {
        pub fn gsapi_new_instance(instance: *mut *mut c_void, caller_handle: *mut c_void) -> c_int;
        pub fn gsapi_delete_instance(instance: *mut c_void);
        pub fn gsapi_set_arg_encoding(instance: *mut c_void, encoding: c_int) -> c_int;
        pub fn gsapi_set_display_callback(
            instance: *mut c_void,
            callback: *mut DisplayCallbackV2,
        ) -> c_int;
        pub fn gsapi_init_with_args(
            instance: *mut c_void,
            argc: c_int,
            argv: *mut *mut c_char,
        ) -> c_int;
        pub fn gsapi_run_file(
            instance: *mut c_void,
            file_name: *const c_char,
            user_errors: c_int,
            exit_code: *mut c_int,
        ) -> c_int;
        pub fn gsapi_set_param(
            instance: *mut c_void,
            param: *const c_char,
            value: *const c_void,
            kind: c_int,
        ) -> c_int;
        pub fn gsapi_exit(instance: *mut c_void) -> c_int;
    }
}

/// State reached from the display callbacks through the caller handle.
struct CallbackState {
    sink: Option<*mut (dyn DisplayCallback + 'static)>,
    frame: Option<(FrameGeometry, *mut u8)>,
}

impl CallbackState {
    /// Runs `f` against the installed sink, translating errors into the
    /// engine's abort code.
    fn dispatch(&mut self, f: impl FnOnce(&mut dyn DisplayCallback) -> CallbackResult) -> c_int {
        let Some(sink) = self.sink else {
            return 0;
        };
        // SAFETY: the sink is installed only for the duration of `run_file`,
        // which holds the exclusive borrow it was created from.
        match f(unsafe { &mut *sink }) {
            Ok(()) => 0,
            Err(e) => {
                debug!("Display callback aborted run: {e}");
                CALLBACK_ABORT
            }
        }
    }

    fn replay_frame(&mut self) -> c_int {
        let Some((geometry, data)) = self.frame else {
            return 0;
        };
        // SAFETY: the device keeps `data` valid until the next size or close
        // event, both of which replace or clear `self.frame`.
        let frame = unsafe { NativeBuffer::from_engine(data, geometry.byte_len()) };
        self.dispatch(|sink| sink.on_size(&geometry, frame))
    }
}

unsafe fn state<'a>(handle: *mut c_void) -> &'a mut CallbackState {
    // SAFETY: `handle` is the boxed state registered with the instance.
    unsafe { &mut *handle.cast::<CallbackState>() }
}

fn geometry(width: c_int, height: c_int, raster: c_int, format: c_uint) -> Option<FrameGeometry> {
    let format = PixelFormat::from_display_format(format)?;
    let geometry = FrameGeometry::new(
        u32::try_from(width).ok()?,
        u32::try_from(height).ok()?,
        usize::try_from(raster).ok()?,
        format,
    );
    geometry.validate().ok()?;
    Some(geometry)
}

unsafe extern "C" fn on_open(handle: *mut c_void, _device: *mut c_void) -> c_int {
    unsafe { state(handle) }.dispatch(|sink| sink.on_open())
}

unsafe extern "C" fn on_preclose(handle: *mut c_void, _device: *mut c_void) -> c_int {
    unsafe { state(handle) }.dispatch(|sink| sink.on_preclose())
}

unsafe extern "C" fn on_close(handle: *mut c_void, _device: *mut c_void) -> c_int {
    let state = unsafe { state(handle) };
    state.frame = None;
    state.dispatch(|sink| sink.on_close())
}

unsafe extern "C" fn on_presize(
    handle: *mut c_void,
    _device: *mut c_void,
    width: c_int,
    height: c_int,
    raster: c_int,
    format: c_uint,
) -> c_int {
    let Some(geometry) = geometry(width, height, raster, format) else {
        warn!("Rejecting display format {format:#x} ({width}x{height})");
        return CALLBACK_ABORT;
    };
    unsafe { state(handle) }.dispatch(|sink| sink.on_presize(&geometry))
}

unsafe extern "C" fn on_size(
    handle: *mut c_void,
    _device: *mut c_void,
    width: c_int,
    height: c_int,
    raster: c_int,
    format: c_uint,
    image: *mut u8,
) -> c_int {
    let Some(geometry) = geometry(width, height, raster, format) else {
        return CALLBACK_ABORT;
    };
    let state = unsafe { state(handle) };
    state.frame = (!image.is_null()).then_some((geometry, image));
    state.replay_frame()
}

unsafe extern "C" fn on_sync(handle: *mut c_void, _device: *mut c_void) -> c_int {
    unsafe { state(handle) }.dispatch(|sink| sink.on_sync())
}

unsafe extern "C" fn on_page(
    handle: *mut c_void,
    _device: *mut c_void,
    copies: c_int,
    flush: c_int,
) -> c_int {
    unsafe { state(handle) }.dispatch(|sink| sink.on_page(copies, flush != 0))
}

unsafe extern "C" fn on_update(
    handle: *mut c_void,
    _device: *mut c_void,
    x: c_int,
    y: c_int,
    width: c_int,
    height: c_int,
) -> c_int {
    unsafe { state(handle) }.dispatch(|sink| sink.on_update(x, y, width, height))
}

/// One Ghostscript interpreter instance driving the display device.
pub struct GhostscriptEngine {
    instance: *mut c_void,
    initialized: bool,
    state: Box<CallbackState>,
    // Registered with the instance; must outlive it.
    _callback: Box<ffi::DisplayCallbackV2>,
}

// SAFETY: the instance is only touched through `&mut self`, and callers
// serialize all access through the operation gate.
unsafe impl Send for GhostscriptEngine {}

impl GhostscriptEngine {
    /// Creates the interpreter instance. Ghostscript allows one per process.
    pub fn new() -> Result<Self, EngineCode> {
        let mut state = Box::new(CallbackState {
            sink: None,
            frame: None,
        });
        let mut callback = Box::new(ffi::DisplayCallbackV2 {
            size: std::mem::size_of::<ffi::DisplayCallbackV2>() as c_int,
            version_major: 2,
            version_minor: 0,
            display_open: Some(on_open),
            display_preclose: Some(on_preclose),
            display_close: Some(on_close),
            display_presize: Some(on_presize),
            display_size: Some(on_size),
            display_sync: Some(on_sync),
            display_page: Some(on_page),
            display_update: Some(on_update),
            display_memalloc: None,
            display_memfree: None,
            display_separation: None,
        });

        let handle = ptr::from_mut::<CallbackState>(&mut state).cast::<c_void>();
        let callback_ptr = ptr::from_mut::<ffi::DisplayCallbackV2>(&mut callback);
        let mut instance = ptr::null_mut();
        // SAFETY: both boxes move into the engine without relocating their
        // contents, so the registered pointers stay valid for its lifetime.
        unsafe { check(ffi::gsapi_new_instance(&mut instance, handle))? };
        let engine = Self {
            instance,
            initialized: false,
            state,
            _callback: callback,
        };
        // SAFETY: `instance` is live; a failure drops `engine`, deleting it.
        unsafe {
            check(ffi::gsapi_set_arg_encoding(instance, ARG_ENCODING_UTF8))?;
            check(ffi::gsapi_set_display_callback(instance, callback_ptr))?;
        }
        debug!("Created Ghostscript instance");
        Ok(engine)
    }
}

fn check(code: c_int) -> Result<(), EngineCode> {
    if code < 0 { Err(code) } else { Ok(()) }
}

fn c_string(value: &str) -> Result<CString, EngineCode> {
    CString::new(value).map_err(|_| INVALID_ARGUMENT)
}

impl RenderEngine for GhostscriptEngine {
    fn init(&mut self, args: &[String]) -> Result<(), EngineCode> {
        let args = args
            .iter()
            .map(|a| c_string(a))
            .collect::<Result<Vec<_>, _>>()?;
        let mut argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr().cast_mut()).collect();
        let argc = c_int::try_from(argv.len()).map_err(|_| INVALID_ARGUMENT)?;

        // SAFETY: `argv` points into `args`, which outlives the call.
        let code = unsafe { ffi::gsapi_init_with_args(self.instance, argc, argv.as_mut_ptr()) };
        if code == E_QUIT {
            // SAFETY: a quit during init requires an explicit exit.
            unsafe { ffi::gsapi_exit(self.instance) };
            return Ok(());
        }
        if let Err(code) = check(code) {
            // SAFETY: as above, for failed initialisation.
            unsafe { ffi::gsapi_exit(self.instance) };
            return Err(code);
        }
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn set_param(&mut self, name: &str, value: &EngineParam) -> Result<(), EngineCode> {
        let name = c_string(name)?;
        let code = match value {
            EngineParam::Bool(v) => {
                let v = c_int::from(*v);
                // SAFETY: `v` outlives the call.
                unsafe { set_param_raw(self.instance, &name, ptr::from_ref(&v).cast(), SPT_BOOL) }
            }
            EngineParam::Int(v) => unsafe {
                set_param_raw(self.instance, &name, ptr::from_ref(v).cast(), SPT_INT)
            },
            EngineParam::Float(v) => unsafe {
                set_param_raw(self.instance, &name, ptr::from_ref(v).cast(), SPT_FLOAT)
            },
            EngineParam::String(v) => {
                let v = c_string(v)?;
                unsafe { set_param_raw(self.instance, &name, v.as_ptr().cast(), SPT_STRING) }
            }
            EngineParam::Parsed(v) => {
                let v = c_string(v)?;
                unsafe { set_param_raw(self.instance, &name, v.as_ptr().cast(), SPT_PARSED) }
            }
        };
        check(code)
    }

    fn run_file(
        &mut self,
        path: &Path,
        display: &mut dyn DisplayCallback,
    ) -> Result<(), EngineCode> {
        let file = c_string(&path.to_string_lossy())?;

        // SAFETY: only the lifetime is erased; the pointer is cleared below
        // before `display` can be used again by the caller.
        let sink: *mut (dyn DisplayCallback + 'static) = unsafe {
            std::mem::transmute::<*mut (dyn DisplayCallback + '_), _>(ptr::from_mut(display))
        };
        self.state.sink = Some(sink);

        let mut code = self.state.replay_frame();
        if code == 0 {
            let mut exit_code: c_int = 0;
            // SAFETY: the instance is initialised and `file` outlives the call.
            code = unsafe { ffi::gsapi_run_file(self.instance, file.as_ptr(), 0, &mut exit_code) };
        }
        self.state.sink = None;
        check(code)
    }

    fn exit(&mut self) {
        if !self.initialized {
            return;
        }
        // SAFETY: the instance was initialised and not yet exited.
        let code = unsafe { ffi::gsapi_exit(self.instance) };
        if code < 0 {
            warn!("gsapi_exit returned {code}");
        }
        self.initialized = false;
        self.state.frame = None;
    }
}

unsafe fn set_param_raw(
    instance: *mut c_void,
    name: &CString,
    value: *const c_void,
    kind: c_int,
) -> c_int {
    // SAFETY: forwarded from the caller.
    unsafe { ffi::gsapi_set_param(instance, name.as_ptr(), value, kind) }
}

impl Drop for GhostscriptEngine {
    fn drop(&mut self) {
        self.exit();
        // SAFETY: the instance is exited and never used again.
        unsafe { ffi::gsapi_delete_instance(self.instance) };
    }
}
