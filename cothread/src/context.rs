use core::fmt;
use std::arch::global_asm;
use std::fmt::{Debug, Formatter};
use std::os::raw::c_void;

use memory_pool::memory::Memory;

/// A `Context` stores a suspended execution state, for it to be resumed later.
///
/// It is the stack pointer of a suspended stack; everything needed to resume
/// (callee-saved registers, FP control words, return address) sits on that
/// stack right above it. Resuming a `Context` consumes it: the state it points
/// at is only valid until it has been resumed once.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Context(*const c_void);

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Context({:p})", self.0)
    }
}

impl Context {
    /// Creates a new `Context` prepared to execute `f` at the top of `stack`.
    ///
    /// `f` is not executed until the first call to `resume()`; it receives the
    /// `Transfer` of that call and must never return.
    ///
    /// # Safety
    ///
    /// `stack` must outlive every use of the returned context and must not be
    /// used by anything else in the meantime.
    #[inline(always)]
    pub(crate) unsafe fn new(stack: &Memory, f: ContextFn) -> Context {
        Context(cothread_make_fcontext(stack.top(), stack.len(), f))
    }

    /// Yields the execution to this `Context`.
    ///
    /// The current state of execution is saved on the current stack and the state
    /// pointed to by `self` is restored and executed next. The call only returns
    /// when someone resumes the caller in turn; the returned `Transfer` then holds
    /// the context of whoever did that and the `data` word they passed.
    ///
    /// # Safety
    ///
    /// `self` must come from `Context::new` or from a `Transfer` and must not
    /// have been resumed before.
    #[inline(always)]
    pub(crate) unsafe fn resume(self, data: *mut c_void) -> Transfer {
        cothread_jump_fcontext(self.0, data)
    }

    /// Address of the saved state, i.e. the suspended stack pointer.
    #[inline]
    pub(crate) fn stack_pointer(&self) -> usize {
        self.0 as usize
    }
}

/// Contains the previously active `Context` and the `data` passed to resume the current one and
/// is used as the return value by `Context::resume()`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    /// The previously executed `Context` which yielded to resume the current one.
    pub context: Context,

    /// The `data` which was passed to `Context::resume()` to resume the current `Context`.
    pub data: *mut c_void,
}

/// Functions of this signature are used as the entry point for a new `Context`.
pub type ContextFn = extern "C" fn(t: Transfer) -> !;

extern "C" {
    /// Creates a new `Context` ontop of some stack.
    ///
    /// # Arguments
    /// * `sp`   - A pointer to the top of the stack.
    /// * `size` - The size of the stack.
    /// * `f`    - A function to be invoked on the first jump to the returned context.
    fn cothread_make_fcontext(sp: *mut c_void, size: usize, f: ContextFn) -> *const c_void;

    /// Yields the execution to another `Context`.
    ///
    /// # Arguments
    /// * `to` - A pointer to the `Context` with whom we swap execution.
    /// * `param`  - An arbitrary argument that will be set as the `data` field
    ///          of the `Transfer` object passed to the other Context.
    fn cothread_jump_fcontext(to: *const c_void, param: *mut c_void) -> Transfer;
}

// x86_64 System V: the frame holds MXCSR + x87 CW, r12-r15, rbx, rbp and the
// return address (0x40 bytes).
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
global_asm!(
    ".text",
    ".globl cothread_make_fcontext",
    ".type cothread_make_fcontext,@function",
    ".align 16",
    "cothread_make_fcontext:",
    "    movq  %rdi, %rax",
    "    andq  $-16, %rax",
    "    leaq  -0x40(%rax), %rax",
    "    stmxcsr  (%rax)",
    "    fnstcw   0x4(%rax)",
    // the trampoline finds the entry function in rbx
    "    movq  %rdx, 0x28(%rax)",
    "    leaq  .Lcothread_trampoline(%rip), %rcx",
    "    movq  %rcx, 0x38(%rax)",
    "    leaq  .Lcothread_finish(%rip), %rcx",
    "    movq  %rcx, 0x30(%rax)",
    "    ret",
    ".Lcothread_trampoline:",
    // push the fake return address, leaving rsp aligned as after a call
    "    push %rbp",
    "    jmp  *%rbx",
    ".Lcothread_finish:",
    "    ud2",
    ".size cothread_make_fcontext,.-cothread_make_fcontext",
    "",
    ".text",
    ".globl cothread_jump_fcontext",
    ".type cothread_jump_fcontext,@function",
    ".align 16",
    "cothread_jump_fcontext:",
    "    leaq  -0x38(%rsp), %rsp",
    "    stmxcsr  (%rsp)",
    "    fnstcw   0x4(%rsp)",
    "    movq  %r12, 0x8(%rsp)",
    "    movq  %r13, 0x10(%rsp)",
    "    movq  %r14, 0x18(%rsp)",
    "    movq  %r15, 0x20(%rsp)",
    "    movq  %rbx, 0x28(%rsp)",
    "    movq  %rbp, 0x30(%rsp)",
    "    movq  %rsp, %rax",
    "    movq  %rdi, %rsp",
    "    movq  0x38(%rsp), %r8",
    "    ldmxcsr  (%rsp)",
    "    fldcw    0x4(%rsp)",
    "    movq  0x8(%rsp), %r12",
    "    movq  0x10(%rsp), %r13",
    "    movq  0x18(%rsp), %r14",
    "    movq  0x20(%rsp), %r15",
    "    movq  0x28(%rsp), %rbx",
    "    movq  0x30(%rsp), %rbp",
    "    leaq  0x40(%rsp), %rsp",
    // Transfer is returned in rax:rdx and passed to a fresh entry in rdi:rsi
    "    movq  %rsi, %rdx",
    "    movq  %rax, %rdi",
    "    jmp  *%r8",
    ".size cothread_jump_fcontext,.-cothread_jump_fcontext",
    options(att_syntax)
);

// AAPCS64: the frame holds d8-d15, x19-x28, fp, lr and the resume pc (0xb0 bytes).
#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
global_asm!(
    ".text",
    ".globl cothread_make_fcontext",
    ".type cothread_make_fcontext,%function",
    ".align 4",
    "cothread_make_fcontext:",
    "    and  x0, x0, ~0xF",
    "    sub  x0, x0, #0xb0",
    "    str  x2, [x0, #0xa0]",
    // no caller frame: a reused stack must not hand out a stale fp
    "    str  xzr, [x0, #0x90]",
    "    adr  x1, .Lcothread_finish",
    "    str  x1, [x0, #0x98]",
    "    ret  x30",
    ".Lcothread_finish:",
    "    brk  #0",
    ".size cothread_make_fcontext,.-cothread_make_fcontext",
    "",
    ".text",
    ".globl cothread_jump_fcontext",
    ".type cothread_jump_fcontext,%function",
    ".align 4",
    "cothread_jump_fcontext:",
    "    sub  sp, sp, #0xb0",
    "    stp  d8,  d9,  [sp, #0x00]",
    "    stp  d10, d11, [sp, #0x10]",
    "    stp  d12, d13, [sp, #0x20]",
    "    stp  d14, d15, [sp, #0x30]",
    "    stp  x19, x20, [sp, #0x40]",
    "    stp  x21, x22, [sp, #0x50]",
    "    stp  x23, x24, [sp, #0x60]",
    "    stp  x25, x26, [sp, #0x70]",
    "    stp  x27, x28, [sp, #0x80]",
    "    stp  x29, x30, [sp, #0x90]",
    "    str  x30, [sp, #0xa0]",
    "    mov  x4, sp",
    "    mov  sp, x0",
    "    ldp  d8,  d9,  [sp, #0x00]",
    "    ldp  d10, d11, [sp, #0x10]",
    "    ldp  d12, d13, [sp, #0x20]",
    "    ldp  d14, d15, [sp, #0x30]",
    "    ldp  x19, x20, [sp, #0x40]",
    "    ldp  x21, x22, [sp, #0x50]",
    "    ldp  x23, x24, [sp, #0x60]",
    "    ldp  x25, x26, [sp, #0x70]",
    "    ldp  x27, x28, [sp, #0x80]",
    "    ldp  x29, x30, [sp, #0x90]",
    // Transfer is returned in x0:x1 and passed to a fresh entry in x0:x1
    "    mov  x0, x4",
    "    ldr  x4, [sp, #0xa0]",
    "    add  sp, sp, #0xb0",
    "    ret  x4",
    ".size cothread_jump_fcontext,.-cothread_jump_fcontext",
);

#[cfg(not(all(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    target_os = "linux"
)))]
compile_error!("cothread only supports x86_64 and aarch64 Linux");

#[cfg(test)]
mod tests {
    use std::os::raw::c_void;

    use memory_pool::memory::Memory;

    use crate::context::{Context, Transfer};

    // This method will always `resume()` immediately back to the
    // previous `Context` with a `data` value of the next number in the fibonacci sequence.
    extern "C" fn fibonacci(mut t: Transfer) -> ! {
        let mut a = 0usize;
        let mut b = 1usize;

        loop {
            t = unsafe { t.context.resume(a as *mut c_void) };

            let next = a + b;
            a = b;
            b = next;
        }
    }

    #[test]
    fn generator() {
        let stack = Memory::new(Memory::default_size()).unwrap();
        let mut context = unsafe { Context::new(&stack, fibonacci) };

        let mut got = Vec::new();
        for _ in 0..10 {
            let t = unsafe { context.resume(std::ptr::null_mut()) };
            context = t.context;
            got.push(t.data as usize);
        }
        assert_eq!(vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34], got);
        // `fibonacci` is left suspended; its frames hold nothing to drop.
    }

    extern "C" fn echo(mut t: Transfer) -> ! {
        loop {
            let doubled = (t.data as usize * 2) as *mut c_void;
            t = unsafe { t.context.resume(doubled) };
        }
    }

    #[test]
    fn data_travels_both_ways() {
        let stack = Memory::new(0).unwrap();
        let mut context = unsafe { Context::new(&stack, echo) };
        for i in 1..5usize {
            let t = unsafe { context.resume(i as *mut c_void) };
            assert_eq!(i * 2, t.data as usize);
            assert!(stack.contains(t.context.stack_pointer()));
            context = t.context;
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn fresh_context_has_no_frame_pointer() {
        let stack = Memory::new(0).unwrap();
        // dirty the stack as a previous fiber would have
        unsafe { std::ptr::write_bytes(stack.bottom() as *mut u8, 0xa5, stack.len()) };
        let context = unsafe { Context::new(&stack, echo) };
        let fp = unsafe { *((context.stack_pointer() + 0x90) as *const usize) };
        assert_eq!(0, fp);
        // the rest of the frame still starts `echo`
        let t = unsafe { context.resume(3 as *mut c_void) };
        assert_eq!(6, t.data as usize);
    }

    extern "C" fn floats(mut t: Transfer) -> ! {
        let mut x = 1.5f64;
        loop {
            x *= 2.0;
            t = unsafe { t.context.resume(x.to_bits() as usize as *mut c_void) };
        }
    }

    #[test]
    fn float_state_survives_switches() {
        let stack = Memory::new(0).unwrap();
        let mut context = unsafe { Context::new(&stack, floats) };
        let mine = 0.25f64;
        let mut expected = 1.5f64;
        for _ in 0..4 {
            let t = unsafe { context.resume(std::ptr::null_mut()) };
            expected *= 2.0;
            assert_eq!(expected.to_bits(), t.data as usize as u64);
            assert_eq!(0.25f64, mine);
            context = t.context;
        }
    }
}
