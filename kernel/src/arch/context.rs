//! Architecture-independent CPU context interface
//!
//! One concrete context type per ISA, selected at build time -- no runtime
//! vtable. Higher layers size and manipulate contexts exclusively through
//! this interface plus [`context_size`].

/// Operations every per-ISA CPU context implements.
pub trait CpuContext: Sized {
    /// Zeroed context; not runnable until [`CpuContext::init`].
    fn new() -> Self;

    /// Arrange for the context to begin execution at `entry` on `stack_top`.
    ///
    /// Kernel contexts route through a trampoline that pops the entry off
    /// the stack and enables interrupts; user contexts start in the
    /// user-mode entry thunk with the right privilege state.
    fn init(&mut self, entry: usize, stack_top: usize, is_user: bool);

    fn instruction_pointer(&self) -> usize;
    fn stack_pointer(&self) -> usize;

    /// Place a syscall/fork return value in the context's return register.
    fn set_return_value(&mut self, value: usize);

    /// Value staged by `set_return_value`.
    fn return_value(&self) -> usize;

    /// Record the translation root to install when this context runs.
    fn set_root_table(&mut self, root: u64);

    /// Record the user-mode entry point and stack for a user context.
    fn set_user_entry(&mut self, entry: usize, user_stack: usize);

    /// User-mode entry point and stack recorded by `set_user_entry`.
    fn user_entry(&self) -> (usize, usize);
}

/// The native context type.
#[cfg(target_arch = "x86_64")]
pub type ArchContext = crate::arch::x86_64::context::X64Context;

#[cfg(target_arch = "x86")]
pub type ArchContext = crate::arch::x86::context::X86Context;

#[cfg(target_arch = "aarch64")]
pub type ArchContext = crate::arch::aarch64::context::Arm64Context;

/// Size of the native context struct, for callers that allocate context
/// storage without knowing the layout.
pub fn context_size() -> usize {
    core::mem::size_of::<ArchContext>()
}

/// Switch from `old` to `new`.
///
/// Saves the callee-saved register state into `old` (skipped when `old` is
/// null -- the switch away from a dying task) and resumes `new`.
///
/// # Safety
///
/// Interrupts must be disabled; `new` must be a context previously filled
/// by `init` or a prior switch; `old`, when non-null, must be writable.
pub unsafe fn switch_context(old: *mut ArchContext, new: *const ArchContext) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Contract forwarded to the caller.
    unsafe {
        crate::arch::x86_64::context::context_switch(old, new)
    };
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: Contract forwarded to the caller.
    unsafe {
        crate::arch::x86::context::context_switch(old, new)
    };
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: Contract forwarded to the caller.
    unsafe {
        crate::arch::aarch64::context::context_switch(old, new)
    };
    #[cfg(not(target_os = "none"))]
    {
        // Hosted builds never actually switch stacks.
        let _ = (old, new);
    }
}

/// Point the next user-to-kernel transition at `stack_top` (TSS.RSP0 on
/// x86, the exception-stack pickup on ARM64).
pub fn set_kernel_stack(stack_top: usize) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::gdt::set_kernel_stack(stack_top as u64);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::set_kernel_stack(stack_top);
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::set_kernel_stack(stack_top);
    #[cfg(not(target_os = "none"))]
    let _ = stack_top;
}
