/// Leak-based static lifetime for process-wide singletons.
///
/// The page pool and the storages built on it are shared by every
/// worker thread for the life of the process, and their hot paths hand
/// out raw page pointers that must not carry a reference count. Leaking
/// them behind a `&'static` keeps those paths free of ownership
/// bookkeeping; tests (and an orderly shutdown) reclaim the allocation
/// through [`StaticLifetime::drop_static`].
///
/// # Safety
///
/// An implementor promises that `drop_static` is only ever called once
/// per leaked value, and only after the last thread that could touch
/// the reference has quiesced. When several leaked singletons depend on
/// each other (a storage on its pool), they must be dropped in reverse
/// dependency order.
pub unsafe trait StaticLifetime: Sized {
    /// Leak the value and hand back the static reference.
    fn new_static(this: Self) -> &'static Self {
        Box::leak(Box::new(this))
    }

    /// Reclaim a reference produced by [`Self::new_static`].
    ///
    /// # Safety
    ///
    /// Caller guarantees exclusive access: no other thread may use the
    /// reference during or after this call.
    unsafe fn drop_static(this: &'static Self) {
        unsafe {
            drop(Box::from_raw(this as *const Self as *mut Self));
        }
    }
}
