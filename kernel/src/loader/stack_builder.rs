//! User-stack construction and argument passing.
//!
//! [`StackBuilder`] pushes raw bytes, words, and C strings onto a user
//! stack through the user-access layer. [`build_arguments`] lays out the
//! initial stack image for `main(argc, argv)` per the SysV i386
//! convention: ascending from the final stack pointer, a fake return
//! address of zero, `argc`, the `argv` pointer, the `argv[0..argc]`
//! pointers, a null sentinel, word-alignment padding, and the argument
//! strings.
//!
//! The layout size and the page-budget check both derive from the same
//! token list, so they cannot disagree: the budget is the rounded-up
//! string bytes plus `(argc + 4)` words, and a command line whose image
//! would overflow one page is refused before anything is pushed.

use crate::{
    Kernel, KernelError,
    addressing::{PAGE_SIZE, Va, WORD_SIZE},
    mm::{self, SharedSpace},
};
use alloc::vec::Vec;

/// A utility for constructing a user-space stack layout.
///
/// The stack grows downward from the address given to
/// [`StackBuilder::new`]; each push lowers the stack pointer and stores
/// through the owning process's address space.
pub struct StackBuilder<'a> {
    kernel: &'a Kernel,
    space: &'a SharedSpace,
    sp: Va,
}

impl<'a> StackBuilder<'a> {
    /// Start building at `top`.
    pub fn new(kernel: &'a Kernel, space: &'a SharedSpace, top: Va) -> Self {
        Self {
            kernel,
            space,
            sp: top,
        }
    }

    /// The current stack pointer.
    #[inline]
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// Round the stack pointer down to a multiple of `align`.
    pub fn align(&mut self, align: usize) {
        while !self.sp.into_usize().is_multiple_of(align) {
            self.sp -= 1;
        }
    }

    /// Push a byte slice; returns its address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Va, KernelError> {
        self.sp -= bytes.len();
        mm::write_user(self.kernel, self.space, self.sp, bytes)?;
        Ok(self.sp)
    }

    /// Push a machine word; returns its address.
    pub fn push_word(&mut self, v: u32) -> Result<Va, KernelError> {
        self.push_bytes(&v.to_le_bytes())
    }

    /// Push a NUL-terminated string; returns its address.
    pub fn push_str(&mut self, s: &str) -> Result<Va, KernelError> {
        self.sp -= 1;
        mm::write_user(self.kernel, self.space, self.sp, &[0])?;
        self.push_bytes(s.as_bytes())
    }
}

/// Lay out argc/argv for `tokens` on the stack ending at `top`.
///
/// Returns the initial user stack pointer. Fails with `InvalidArgument`
/// when there are no tokens or the image exceeds one page.
pub fn build_arguments(
    kernel: &Kernel,
    space: &SharedSpace,
    tokens: &[&str],
    top: Va,
) -> Result<Va, KernelError> {
    if tokens.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let argc = tokens.len();
    let string_bytes: usize = tokens.iter().map(|t| t.len() + 1).sum();
    let total = string_bytes.next_multiple_of(WORD_SIZE) + (argc + 4) * WORD_SIZE;
    if total > PAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }

    let mut builder = StackBuilder::new(kernel, space, top);

    // Strings first, so argv[0]'s bytes end up lowest.
    let mut argv = Vec::with_capacity(argc);
    for token in tokens.iter().rev() {
        argv.push(builder.push_str(token)?);
    }
    argv.reverse();

    builder.align(WORD_SIZE);
    builder.push_word(0)?; // argv[argc] sentinel
    for addr in argv.iter().rev() {
        builder.push_word(addr.into_usize() as u32)?;
    }
    let argv_base = builder.sp();
    builder.push_word(argv_base.into_usize() as u32)?;
    builder.push_word(argc as u32)?;
    let sp = builder.push_word(0)?; // fake return address

    debug_assert_eq!(top - sp, total);
    Ok(sp)
}
