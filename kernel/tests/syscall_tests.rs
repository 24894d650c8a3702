//! Syscall dispatch integration tests: number routing, errno surface, and
//! the trap-frame round trip on the build architecture.

use castor_kernel::error::errno;
use castor_kernel::syscall::{self, SyscallArgs};

fn args(number: u64) -> SyscallArgs {
    SyscallArgs {
        number,
        args: [0; 6],
        extra: None,
    }
}

#[test]
fn unknown_and_reserved_numbers_yield_enosys() {
    syscall::init();
    // One past the table.
    assert_eq!(syscall::dispatch(&args(syscall::SYS_LIMIT)), -errno::ENOSYS);
    // Reserved consumer classes are unclaimed until their subsystems come up.
    for nr in [
        syscall::SYS_OPEN,
        syscall::SYS_SOCKET,
        syscall::SYS_SIGACTION,
        syscall::SYS_EXECVE,
    ] {
        assert_eq!(syscall::dispatch(&args(nr)), -errno::ENOSYS);
    }
}

#[test]
fn getpid_and_getppid_report_the_current_task() {
    syscall::init();
    let pid = syscall::dispatch(&args(syscall::SYS_GETPID));
    assert_eq!(pid, castor_kernel::sched::current_pid() as i64);
    let ppid = syscall::dispatch(&args(syscall::SYS_GETPPID));
    assert!(ppid >= 0);
}

#[test]
fn sched_yield_returns_zero() {
    syscall::init();
    assert_eq!(syscall::dispatch(&args(syscall::SYS_SCHED_YIELD)), 0);
}

#[test]
fn consumer_registration_claims_a_number_once() {
    syscall::init();

    fn stub(args: &SyscallArgs) -> i64 {
        args.args[0] as i64 * 2
    }
    syscall::register(syscall::SYS_SELECT, stub).expect("unclaimed number");
    assert!(syscall::register(syscall::SYS_SELECT, stub).is_err());

    let mut call = args(syscall::SYS_SELECT);
    call.args[0] = 21;
    assert_eq!(syscall::dispatch(&call), 42);
}

#[test]
fn waitpid_with_no_children_is_echild() {
    syscall::init();
    assert_eq!(syscall::dispatch(&args(syscall::SYS_WAITPID)), -errno::ECHILD);
}

#[test]
fn gettimeofday_writes_through_the_user_pointer() {
    syscall::init();
    // Host heap addresses sit in the user half on x86_64, so the copy-out
    // path is exercised for real.
    let out = Box::new([0u8; 16]);
    let ptr = Box::into_raw(out);
    let mut call = args(syscall::SYS_GETTIMEOFDAY);
    call.args[0] = ptr as u64;
    assert_eq!(syscall::dispatch(&call), 0);
    // Reclaim; the contents are tick-dependent, success is the assertion.
    drop(unsafe { Box::from_raw(ptr) });

    // A null pointer is rejected.
    assert_eq!(
        syscall::dispatch(&args(syscall::SYS_GETTIMEOFDAY)),
        -errno::EINVAL
    );
}

#[test]
fn uname_reports_castoros() {
    syscall::init();
    let out = Box::new([0u8; 5 * 65]);
    let ptr = Box::into_raw(out);
    let mut call = args(syscall::SYS_UNAME);
    call.args[0] = ptr as u64;
    assert_eq!(syscall::dispatch(&call), 0);
    let buf = unsafe { Box::from_raw(ptr) };
    assert!(buf.starts_with(b"CastorOS\0"));
    let machine = &buf[4 * 65..];
    let caps = castor_kernel::hal_capabilities();
    assert!(machine.starts_with(caps.arch_name.as_bytes()));
}

#[test]
fn getrandom_fills_the_buffer() {
    syscall::init();
    let out = Box::new([0u8; 32]);
    let ptr = Box::into_raw(out);
    let mut call = args(syscall::SYS_GETRANDOM);
    call.args[0] = ptr as u64;
    call.args[1] = 32;
    assert_eq!(syscall::dispatch(&call), 32);
    let buf = unsafe { Box::from_raw(ptr) };
    assert!(buf.iter().any(|&b| b != 0), "32 zero bytes is not random");
}

// The trap-frame round trip (scenario: number in the ISA's syscall
// register, result back in the return register) on the build architecture.
#[cfg(target_arch = "x86_64")]
mod trap_frame {
    use super::*;
    use castor_kernel::arch::x86_64::idt::TrapFrame;
    use castor_kernel::arch::x86_64::syscall::{args_from_frame, set_return};

    #[test]
    fn getpid_roundtrip_through_a_trap_frame() {
        syscall::init();

        let mut frame = TrapFrame::zeroed();
        frame.rax = syscall::SYS_GETPID;

        let args = args_from_frame(&frame);
        assert_eq!(args.number, syscall::SYS_GETPID);

        let ret = syscall::dispatch(&args);
        set_return(&mut frame, ret);
        assert_eq!(frame.rax, castor_kernel::sched::current_pid() as u64);
    }

    #[test]
    fn argument_registers_follow_the_abi() {
        let mut frame = TrapFrame::zeroed();
        frame.rax = syscall::SYS_MMAP;
        frame.rdi = 0x1000;
        frame.rsi = 0x2000;
        frame.rdx = 3;
        frame.r10 = 4;
        frame.r8 = 5;
        frame.r9 = 6;
        let args = args_from_frame(&frame);
        assert_eq!(args.args, [0x1000, 0x2000, 3, 4, 5, 6]);
    }
}
