#![cfg_attr(not(test), no_std)]

use core::{
    ffi::{c_int, c_void},
    ptr::{self, NonNull},
};
use s2tc::{BlockAllocator, Config, DistanceMode, DxtMode, EncodeError, S2tcEncodeContext};

#[cfg(not(test))]
#[panic_handler]
fn panic_handler(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

/// Returned by [`s2tc_encode_block`] when an allocation failed.
pub const S2TC_OOM: c_int = -1;
/// Returned by [`s2tc_encode_block`] when the block size, stride, or a pointer is invalid.
pub const S2TC_INVALID: c_int = -2;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S2tcDxtMode {
    Dxt1,
    Dxt3,
    Dxt5,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S2tcDistMode {
    Rgb,
    Srgb,
    Yuv,
    Avg,
}

impl From<S2tcDxtMode> for DxtMode {
    fn from(mode: S2tcDxtMode) -> Self {
        match mode {
            S2tcDxtMode::Dxt1 => DxtMode::Dxt1,
            S2tcDxtMode::Dxt3 => DxtMode::Dxt3,
            S2tcDxtMode::Dxt5 => DxtMode::Dxt5,
        }
    }
}

impl From<S2tcDistMode> for DistanceMode {
    fn from(mode: S2tcDistMode) -> Self {
        match mode {
            S2tcDistMode::Rgb => DistanceMode::Rgb,
            S2tcDistMode::Srgb => DistanceMode::Srgb,
            S2tcDistMode::Yuv => DistanceMode::Yuv,
            S2tcDistMode::Avg => DistanceMode::Avg,
        }
    }
}

pub type S2tcMalloc = unsafe extern "C" fn(size: usize) -> *mut c_void;
pub type S2tcFree = unsafe extern "C" fn(ptr: *mut c_void);

extern "C" {
    fn malloc(size: usize) -> *mut c_void;
    fn free(ptr: *mut c_void);
}

/// Encoder context. Initialize with [`s2tc_init`] before use.
#[repr(C)]
pub struct S2tcContext {
    pub dxt: S2tcDxtMode,
    pub dist: S2tcDistMode,
    /// Non-zero to mark pixels with alpha 0 as transparent in DXT1 blocks.
    pub dxt1_alpha: bool,
    pub malloc: S2tcMalloc,
    pub free: S2tcFree,
}

impl S2tcContext {
    fn encoder(&self) -> S2tcEncodeContext {
        S2tcEncodeContext::new(
            Config::new(self.dxt.into(), self.dist.into()).with_dxt1_alpha(self.dxt1_alpha),
        )
    }
}

/// Routes buffer allocations through the context's memory functions.
struct CAllocator {
    malloc: S2tcMalloc,
    free: S2tcFree,
}

unsafe impl BlockAllocator for CAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // malloc(0) may legally return null
        NonNull::new(unsafe { (self.malloc)(size.max(1)) }.cast())
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, _size: usize) {
        (self.free)(ptr.as_ptr().cast())
    }
}

/// Initializes a context with the given modes, DXT1 alpha enabled, and the C library's
/// `malloc`/`free`.
///
/// # Safety
///
/// `ctx` must be valid for writes of one `S2tcContext`. It does not need to be initialized.
#[no_mangle]
pub unsafe extern "C" fn s2tc_init(ctx: *mut S2tcContext, dxt: S2tcDxtMode, dist: S2tcDistMode) {
    ctx.write(S2tcContext {
        dxt,
        dist,
        dxt1_alpha: true,
        malloc,
        free,
    });
}

/// Sets the memory functions used for buffers returned by [`s2tc_encode_image`]. Passing null
/// for either function restores the C library's default.
///
/// # Safety
///
/// `ctx` must point to an initialized context.
#[no_mangle]
pub unsafe extern "C" fn s2tc_set_memory_functions(
    ctx: *mut S2tcContext,
    alloc: Option<S2tcMalloc>,
    dealloc: Option<S2tcFree>,
) {
    let ctx = &mut *ctx;
    ctx.malloc = alloc.unwrap_or(malloc);
    ctx.free = dealloc.unwrap_or(free);
}

/// # Safety
///
/// `ctx` must point to an initialized context.
#[no_mangle]
pub unsafe extern "C" fn s2tc_set_mode_dist(ctx: *mut S2tcContext, dist: S2tcDistMode) {
    (*ctx).dist = dist;
}

/// # Safety
///
/// `ctx` must point to an initialized context.
#[no_mangle]
pub unsafe extern "C" fn s2tc_set_mode_dxt(ctx: *mut S2tcContext, dxt: S2tcDxtMode) {
    (*ctx).dxt = dxt;
}

/// # Safety
///
/// `ctx` must point to an initialized context.
#[no_mangle]
pub unsafe extern "C" fn s2tc_set_dxt1_alpha(ctx: *mut S2tcContext, enabled: bool) {
    (*ctx).dxt1_alpha = enabled;
}

/// Encodes one block of RGBA8888 pixels.
///
/// - `ctx`: Pointer to an initialized context
/// - `out`: Output block, 8 bytes for DXT1 and 16 bytes for DXT3/DXT5
/// - `rgba`: Pointer to the top left pixel of the block
/// - `iw`: Row stride of the image, in pixels
/// - `w`, `h`: Size of the block, 1 to 4 pixels each
///
/// Returns 0 on success, [`S2TC_OOM`] if memory ran out, or [`S2TC_INVALID`] if the arguments
/// are invalid. `out` is untouched on failure.
///
/// # Safety
///
/// `rgba` must be readable for `((h - 1) * iw + w) * 4` bytes, and `out` writable for the
/// block size of the current mode.
#[no_mangle]
pub unsafe extern "C" fn s2tc_encode_block(
    ctx: *const S2tcContext,
    out: *mut u8,
    rgba: *const u8,
    iw: usize,
    w: usize,
    h: usize,
) -> c_int {
    if ctx.is_null() || out.is_null() || rgba.is_null() {
        return S2TC_INVALID;
    }
    if !(1..=4).contains(&w) || !(1..=4).contains(&h) || iw < w {
        return S2TC_INVALID;
    }
    let Some(input_len) = (h - 1)
        .checked_mul(iw)
        .and_then(|n| n.checked_add(w))
        .and_then(|n| n.checked_mul(4))
    else {
        return S2TC_INVALID;
    };

    let encoder = (*ctx).encoder();
    let rgba = core::slice::from_raw_parts(rgba, input_len);
    let out = core::slice::from_raw_parts_mut(out, encoder.config().dxt.block_size());

    match encoder.encode_block(rgba, iw, w, h, out) {
        Ok(_) => 0,
        Err(EncodeError::OutOfMemory { .. }) => S2TC_OOM,
        Err(_) => S2TC_INVALID,
    }
}

/// Encodes a tightly packed `width` x `height` RGBA8888 image into a new buffer allocated with
/// the context's `malloc`.
///
/// Returns the buffer and stores its length in `out_len`, or returns null if the arguments are
/// invalid or the allocation failed. Release the buffer with the context's `free`.
///
/// # Safety
///
/// `rgba` must be readable for `width * height * 4` bytes, and `out_len` writable.
#[no_mangle]
pub unsafe extern "C" fn s2tc_encode_image(
    ctx: *const S2tcContext,
    rgba: *const u8,
    width: usize,
    height: usize,
    out_len: *mut usize,
) -> *mut u8 {
    if ctx.is_null() || rgba.is_null() || out_len.is_null() {
        return ptr::null_mut();
    }
    let Some(input_len) = width.checked_mul(height).and_then(|n| n.checked_mul(4)) else {
        return ptr::null_mut();
    };

    let ctx = &*ctx;
    let allocator = CAllocator {
        malloc: ctx.malloc,
        free: ctx.free,
    };
    let rgba = core::slice::from_raw_parts(rgba, input_len);

    match ctx.encoder().encode_image_with(allocator, rgba, width, height) {
        Ok(buf) => {
            let (ptr, len, _) = buf.into_raw_parts();
            out_len.write(len);
            ptr.as_ptr()
        }
        Err(_) => ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn init(dxt: S2tcDxtMode, dist: S2tcDistMode) -> S2tcContext {
        let mut ctx = MaybeUninit::uninit();
        unsafe {
            s2tc_init(ctx.as_mut_ptr(), dxt, dist);
            ctx.assume_init()
        }
    }

    #[test]
    fn encodes_block_through_c_api() {
        let ctx = init(S2tcDxtMode::Dxt1, S2tcDistMode::Avg);
        let rgba = [[128u8, 64, 32, 255]; 16].concat();
        let mut out = [0xAAu8; 16];

        let ret = unsafe { s2tc_encode_block(&ctx, out.as_mut_ptr(), rgba.as_ptr(), 4, 4, 4) };

        assert_eq!(ret, 0);
        assert_eq!(&out[..8], &[0x04, 0x82, 0x04, 0x82, 0, 0, 0, 0]);
        // only the DXT1 block size is written
        assert_eq!(&out[8..], &[0xAA; 8]);
    }

    #[test]
    fn rejects_invalid_block_sizes() {
        let ctx = init(S2tcDxtMode::Dxt5, S2tcDistMode::Rgb);
        let rgba = [0u8; 64];
        let mut out = [0u8; 16];

        for (iw, w, h) in [(4, 0, 4), (4, 4, 5), (2, 3, 1)] {
            let ret = unsafe { s2tc_encode_block(&ctx, out.as_mut_ptr(), rgba.as_ptr(), iw, w, h) };
            assert_eq!(ret, S2TC_INVALID, "{iw} {w} {h}");
        }
    }

    #[test]
    fn setters_update_context() {
        let mut ctx = init(S2tcDxtMode::Dxt1, S2tcDistMode::Rgb);
        unsafe {
            s2tc_set_mode_dxt(&mut ctx, S2tcDxtMode::Dxt3);
            s2tc_set_mode_dist(&mut ctx, S2tcDistMode::Yuv);
            s2tc_set_dxt1_alpha(&mut ctx, false);
        }
        assert_eq!(
            ctx.encoder().config(),
            Config::new(DxtMode::Dxt3, DistanceMode::Yuv).with_dxt1_alpha(false)
        );
    }

    unsafe extern "C" fn failing_malloc(_size: usize) -> *mut c_void {
        ptr::null_mut()
    }

    #[test]
    fn encodes_image_with_custom_allocator() {
        let mut ctx = init(S2tcDxtMode::Dxt5, S2tcDistMode::Srgb);
        let rgba = [7u8; 6 * 5 * 4];
        let mut len = 0;

        let buf = unsafe { s2tc_encode_image(&ctx, rgba.as_ptr(), 6, 5, &mut len) };
        assert!(!buf.is_null());
        assert_eq!(len, 2 * 2 * 16);
        unsafe { (ctx.free)(buf.cast()) };

        unsafe { s2tc_set_memory_functions(&mut ctx, Some(failing_malloc), None) };
        let buf = unsafe { s2tc_encode_image(&ctx, rgba.as_ptr(), 6, 5, &mut len) };
        assert!(buf.is_null());

        unsafe { s2tc_set_memory_functions(&mut ctx, None, None) };
        let buf = unsafe { s2tc_encode_image(&ctx, rgba.as_ptr(), 6, 5, &mut len) };
        assert!(!buf.is_null());
        unsafe { (ctx.free)(buf.cast()) };
    }
}
