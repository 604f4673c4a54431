//! Table of syscalls that carry filesystem paths, and where those paths live.
//!
//! Numbers and register positions follow the x86_64 syscall ABI. Calls that
//! never take a path (`getdents64`, `read`, ...) are simply absent and pass
//! through untouched.

use log::debug;
use nix::unistd::Pid;

use crate::regs::Reg::{self, R10, Rdi, Rdx, Rsi};

/// Extra work attached to a table entry, run around argument processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Hook {
    None,
    /// Debug-level note about known quirks of the call.
    Notice(&'static str),
}

impl Hook {
    pub(crate) fn run(self, desc: &SyscallDesc, pid: Pid) {
        match self {
            Hook::None => {}
            Hook::Notice(note) => debug!("'{}' ({}): {}", desc.name, pid, note),
        }
    }
}

/// How to find the path arguments of one syscall.
#[derive(Debug)]
pub(crate) struct SyscallDesc {
    pub(crate) nr: i64,
    pub(crate) name: &'static str,
    pub(crate) path_args: &'static [Reg],
    pub(crate) pre_hook: Hook,
    pub(crate) post_hook: Hook,
}

const fn path_call(nr: i64, name: &'static str, path_args: &'static [Reg]) -> SyscallDesc {
    SyscallDesc {
        nr,
        name,
        path_args,
        pre_hook: Hook::None,
        post_hook: Hook::None,
    }
}

static SYSCALLS: &[SyscallDesc] = &[
    path_call(libc::SYS_open, "open", &[Rdi]),
    path_call(libc::SYS_stat, "stat", &[Rdi]),
    path_call(libc::SYS_lstat, "lstat", &[Rdi]),
    path_call(libc::SYS_access, "access", &[Rdi]),
    path_call(libc::SYS_execve, "execve", &[Rdi]),
    path_call(libc::SYS_truncate, "truncate", &[Rdi]),
    path_call(libc::SYS_chdir, "chdir", &[Rdi]),
    path_call(libc::SYS_rename, "rename", &[Rdi, Rsi]),
    path_call(libc::SYS_mkdir, "mkdir", &[Rdi]),
    path_call(libc::SYS_rmdir, "rmdir", &[Rdi]),
    path_call(libc::SYS_creat, "creat", &[Rdi]),
    path_call(libc::SYS_link, "link", &[Rdi, Rsi]),
    path_call(libc::SYS_unlink, "unlink", &[Rdi]),
    path_call(libc::SYS_symlink, "symlink", &[Rdi, Rsi]),
    path_call(libc::SYS_readlink, "readlink", &[Rdi]),
    path_call(libc::SYS_chmod, "chmod", &[Rdi]),
    path_call(libc::SYS_chown, "chown", &[Rdi]),
    path_call(libc::SYS_lchown, "lchown", &[Rdi]),
    path_call(libc::SYS_utime, "utime", &[Rdi]),
    path_call(libc::SYS_mknod, "mknod", &[Rdi]),
    path_call(libc::SYS_statfs, "statfs", &[Rdi]),
    path_call(libc::SYS_pivot_root, "pivot_root", &[Rdi, Rsi]),
    path_call(libc::SYS_chroot, "chroot", &[Rdi]),
    path_call(libc::SYS_mount, "mount", &[Rdi, Rsi]),
    path_call(libc::SYS_umount2, "umount2", &[Rdi]),
    path_call(libc::SYS_swapon, "swapon", &[Rdi]),
    path_call(libc::SYS_swapoff, "swapoff", &[Rdi]),
    path_call(libc::SYS_setxattr, "setxattr", &[Rdi]),
    path_call(libc::SYS_lsetxattr, "lsetxattr", &[Rdi]),
    path_call(libc::SYS_getxattr, "getxattr", &[Rdi]),
    path_call(libc::SYS_lgetxattr, "lgetxattr", &[Rdi]),
    path_call(libc::SYS_listxattr, "listxattr", &[Rdi]),
    path_call(libc::SYS_llistxattr, "llistxattr", &[Rdi]),
    path_call(libc::SYS_removexattr, "removexattr", &[Rdi]),
    path_call(libc::SYS_lremovexattr, "lremovexattr", &[Rdi]),
    path_call(libc::SYS_utimes, "utimes", &[Rdi]),
    path_call(libc::SYS_inotify_add_watch, "inotify_add_watch", &[Rsi]),
    path_call(libc::SYS_openat, "openat", &[Rsi]),
    path_call(libc::SYS_mkdirat, "mkdirat", &[Rsi]),
    path_call(libc::SYS_mknodat, "mknodat", &[Rsi]),
    path_call(libc::SYS_fchownat, "fchownat", &[Rsi]),
    path_call(libc::SYS_futimesat, "futimesat", &[Rsi]),
    path_call(libc::SYS_newfstatat, "newfstatat", &[Rsi]),
    path_call(libc::SYS_unlinkat, "unlinkat", &[Rsi]),
    path_call(libc::SYS_renameat, "renameat", &[Rsi, R10]),
    path_call(libc::SYS_linkat, "linkat", &[Rsi, R10]),
    path_call(libc::SYS_symlinkat, "symlinkat", &[Rdi, Rdx]),
    path_call(libc::SYS_readlinkat, "readlinkat", &[Rsi]),
    path_call(libc::SYS_fchmodat, "fchmodat", &[Rsi]),
    path_call(libc::SYS_faccessat, "faccessat", &[Rsi]),
    SyscallDesc {
        pre_hook: Hook::Notice("utimensat is known to sometimes fail, e.g. under `touch`"),
        ..path_call(libc::SYS_utimensat, "utimensat", &[Rsi])
    },
    path_call(libc::SYS_name_to_handle_at, "name_to_handle_at", &[Rsi]),
    path_call(libc::SYS_renameat2, "renameat2", &[Rsi, R10]),
    path_call(libc::SYS_execveat, "execveat", &[Rsi]),
    path_call(libc::SYS_statx, "statx", &[Rsi]),
];

/// All interceptible syscalls, in lookup order.
pub(crate) fn table() -> &'static [SyscallDesc] {
    SYSCALLS
}

/// First table entry for syscall number `nr`, if the call carries a path.
pub(crate) fn resolve(nr: i64) -> Option<&'static SyscallDesc> {
    SYSCALLS.iter().find(|desc| desc.nr == nr)
}
