//! Process lifecycle and the exit/wait protocol.
//!
//! [`Process::execute`] copies the command line, spawns a kernel thread
//! that loads the executable, and blocks on a start semaphore until the
//! child reports whether the load worked. The child registers its
//! [`ExitStatus`] with the parent before it runs, write-denies its own
//! image for its lifetime, and finally enters "user mode" — on a hosted
//! build, the supplied user-program body, run with the process and its
//! [`LoadInfo`] in hand, exactly the way a grader drives a task. A panic
//! in that body is the moral equivalent of a kernel exception in a user
//! thread: the process dies with exit value -1 and nobody else is
//! affected.
//!
//! ## Exit-status ownership
//!
//! The [`ExitStatus`] object is jointly owned: the parent's child list
//! holds it strongly, the child holds a weak back reference. The child's
//! exit stores the exit value and ups `wait_on_exit` exactly once — but
//! only if the parent is still around to care; a parent that exited first
//! dropped the strong references, the child's upgrade fails, and the
//! object is already gone. Whichever side drops the last reference frees
//! the object, precisely once, with no window where either may touch a
//! freed peer.

use crate::{
    Kernel, KernelError,
    addressing::Va,
    fs::{File, FileTable},
    loader::{self, LoadInfo},
    mm::{self, AddressSpace, SharedSpace},
    sync::{Semaphore, SpinLock},
    thread::ThreadBuilder,
};
use alloc::{
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicU64, Ordering};

/// A process (thread) identifier.
pub type Tid = u64;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// The synchronization object connecting a parent's `wait` to a child's
/// termination.
pub struct ExitStatus {
    /// The child's identifier.
    pub tid: Tid,
    value: AtomicI32,
    /// Upped exactly once, by the child, after the exit value is stored.
    wait_on_exit: Semaphore,
}

impl ExitStatus {
    fn new(tid: Tid) -> Self {
        Self {
            tid,
            value: AtomicI32::new(-1),
            wait_on_exit: Semaphore::new(0),
        }
    }
}

/// Load-result handoff from `start_process` back to `execute`.
struct StartStatus {
    sema: Semaphore,
    success: AtomicBool,
    errno: AtomicIsize,
}

/// A user process.
pub struct Process {
    /// The kernel this process runs on.
    pub kernel: Arc<Kernel>,
    /// Unique identifier.
    pub tid: Tid,
    /// Program name (the command line's leading token).
    pub name: String,
    /// The process's address space.
    pub mm: SharedSpace,
    files: SpinLock<FileTable>,
    /// The executable image, held open and write-denied for the process
    /// lifetime.
    exec_file: SpinLock<Option<flat_fs::FsFile>>,
    children: SpinLock<Vec<Arc<ExitStatus>>>,
    /// Back reference into the parent; taken by the child on exit.
    exit_status: SpinLock<Option<Weak<ExitStatus>>>,
    is_user: AtomicBool,
    exited: AtomicBool,
}

/// Split a command line on spaces; runs of spaces yield no empty tokens.
fn tokenize(cmd_line: &str) -> Vec<String> {
    cmd_line
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

impl Process {
    /// The initial kernel process. It never enters user mode and has no
    /// parent to notify.
    pub fn launch(kernel: &Arc<Kernel>, name: &str) -> Arc<Process> {
        Arc::new(Process {
            kernel: Arc::clone(kernel),
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            mm: AddressSpace::new_bare(),
            files: SpinLock::new(FileTable::new()),
            exec_file: SpinLock::new(None),
            children: SpinLock::new(Vec::new()),
            exit_status: SpinLock::new(None),
            is_user: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        })
    }

    /// Start a child process running `cmd_line`, whose user-mode run is a
    /// no-op. See [`Process::execute_with`].
    pub fn execute(self: &Arc<Self>, cmd_line: &str) -> Result<Tid, KernelError> {
        self.execute_with(cmd_line, |_, _| 0)
    }

    /// Start a child process from `cmd_line`'s leading token, passing the
    /// remaining tokens as arguments.
    ///
    /// Returns once the child has attempted the load: the child's id on
    /// success, or the load error. `user_main` stands in for the user-mode
    /// execution of the program; its return value becomes the exit value,
    /// and a panic inside it kills only this process, with exit value -1.
    pub fn execute_with<F>(self: &Arc<Self>, cmd_line: &str, user_main: F) -> Result<Tid, KernelError>
    where
        F: FnOnce(&Arc<Process>, LoadInfo) -> i32 + Send + 'static,
    {
        // Copy the command line; the caller's buffer stays its own, and
        // the child parses the copy at its leisure.
        let cmd = cmd_line.to_string();
        let tokens = tokenize(&cmd);
        let Some(program) = tokens.first().cloned() else {
            return Err(KernelError::InvalidArgument);
        };

        let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(ExitStatus::new(tid));
        let mut children = self.children.lock();
        children.push(Arc::clone(&status));
        children.unlock();

        let start = Arc::new(StartStatus {
            sema: Semaphore::new(0),
            success: AtomicBool::new(false),
            errno: AtomicIsize::new(KernelError::NoExec.into_isize()),
        });

        let kernel = Arc::clone(&self.kernel);
        let child_start = Arc::clone(&start);
        let back_ref = Arc::downgrade(&status);
        ThreadBuilder::new(program).spawn(move || {
            start_process(kernel, tid, cmd, back_ref, child_start, user_main);
        });

        start.sema.down();
        if start.success.load(Ordering::Acquire) {
            Ok(tid)
        } else {
            // The child stays in the child list: it exited with -1 and
            // remains reapable through `wait`.
            Err(
                KernelError::try_from(start.errno.load(Ordering::Acquire))
                    .unwrap_or(KernelError::NoExec),
            )
        }
    }

    /// Wait for the child `child` to die and return its exit value.
    ///
    /// Returns -1 immediately when `child` is not an unreaped child of
    /// this process; each child can be waited for once.
    pub fn wait(&self, child: Tid) -> i32 {
        let children = self.children.lock();
        let Some(status) = children
            .iter()
            .find(|status| status.tid == child)
            .map(Arc::clone)
        else {
            children.unlock();
            return -1;
        };
        // Sleeping with the list lock held would block exit notifications
        // from siblings; release it before going down.
        children.unlock();

        status.wait_on_exit.down();
        let value = status.value.load(Ordering::Acquire);

        let mut children = self.children.lock();
        children.retain(|status| status.tid != child);
        children.unlock();
        value
    }

    /// Terminate this process with `status`.
    ///
    /// Releases every resource the process holds, prints the exit line if
    /// it ran user code, and hands the exit value to a waiting parent.
    pub fn exit(self: &Arc<Self>, status: i32) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }

        // Detach the children: dropping the strong references is what
        // nulls each child's back-pointer. A child that exits later will
        // fail its upgrade and skip the notification.
        let mut children = self.children.lock();
        let orphans: Vec<_> = children.drain(..).collect();
        children.unlock();
        drop(orphans);

        // Re-allow writes to the executable and close it.
        let mut exec = self.exec_file.lock();
        if let Some(image) = exec.take() {
            image.allow_write();
        }
        exec.unlock();

        // Close all open file handles and release the table.
        let mut files = self.files.lock();
        files.clear();
        files.unlock();

        // Tear down the address space. The page directory is moved out of
        // the process before the kernel directory takes over, and
        // destroyed after; a preemption in between sees either the live
        // directory or none, never a freed one.
        let mut space = self.mm.lock();
        mm::destroy(&self.kernel, &mut space);
        space.unlock();

        if self.is_user.load(Ordering::Acquire) {
            self.kernel
                .console_print(format_args!("{}: exit({})\n", self.name, status));
        }

        // Notify the parent, if it still exists: store the value, then up
        // the semaphore, at most once in this process's lifetime.
        let mut back_ref = self.exit_status.lock();
        let back_ref_taken = back_ref.take();
        back_ref.unlock();
        if let Some(exit_status) = back_ref_taken.and_then(|weak| weak.upgrade()) {
            exit_status.value.store(status, Ordering::Release);
            exit_status.wait_on_exit.up();
        }
    }

    /// Make this process's address space the active one, as on a context
    /// switch to one of its threads.
    pub fn activate(&self) {
        let space = self.mm.lock();
        if let Some(pagedir) = space.pagedir.as_ref() {
            pagedir.flush_tlb();
        }
        space.unlock();
    }

    /// Whether the process reached user mode.
    pub fn is_user(&self) -> bool {
        self.is_user.load(Ordering::Acquire)
    }

    // Kernel-side service surface: what the syscall layer calls on behalf
    // of this process.

    /// Open a file, returning its descriptor.
    pub fn open(&self, path: &str) -> Result<usize, KernelError> {
        let node = self.kernel.fs.open(path)?;
        let mut files = self.files.lock();
        let fd = files.insert(File::new(node));
        files.unlock();
        fd
    }

    /// Close a descriptor.
    pub fn close(&self, fd: usize) -> Result<(), KernelError> {
        let mut files = self.files.lock();
        let r = files.remove(fd).map(drop);
        files.unlock();
        r
    }

    /// Read from a descriptor at its current position.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut files = self.files.lock();
        let r = files.get_mut(fd).and_then(|file| file.read(buf));
        files.unlock();
        r
    }

    /// Write to a descriptor at its current position. Descriptor 1 is the
    /// console. A write-denied file accepts nothing and returns 0.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize, KernelError> {
        if fd == 1 {
            self.kernel
                .console_print(format_args!("{}", String::from_utf8_lossy(buf)));
            return Ok(buf.len());
        }
        let mut files = self.files.lock();
        let r = files.get_mut(fd).and_then(|file| file.write(buf));
        files.unlock();
        r
    }

    /// Move a descriptor's position.
    pub fn seek(&self, fd: usize, pos: usize) -> Result<(), KernelError> {
        let mut files = self.files.lock();
        let r = files.get_mut(fd).map(|file| file.seek(pos));
        files.unlock();
        r
    }

    /// A descriptor's position.
    pub fn tell(&self, fd: usize) -> Result<usize, KernelError> {
        let mut files = self.files.lock();
        let r = files.get_mut(fd).map(|file| file.tell());
        files.unlock();
        r
    }

    /// Copy user memory into `buf`, demand-paging as needed.
    pub fn read_memory(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        mm::read_user(&self.kernel, &self.mm, va, buf)
    }

    /// Copy `buf` into user memory, demand-paging as needed.
    pub fn write_memory(&self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        mm::write_user(&self.kernel, &self.mm, va, buf)
    }

    /// Map `len` bytes of the open file `fd` at `addr`.
    pub fn mmap(&self, fd: usize, addr: Va, len: usize) -> Result<usize, KernelError> {
        let mut files = self.files.lock();
        let node = files.get_mut(fd).map(|file| file.node().clone());
        files.unlock();
        mm::mmap(&self.mm, &node?, addr, len, 0, true)
    }

    /// Remove the `len`-byte mapping at `addr`.
    pub fn munmap(&self, addr: Va, len: usize) -> Result<(), KernelError> {
        mm::munmap(&self.kernel, &self.mm, addr, len)
    }
}

/// The child-side half of `execute`: load, report, run, exit.
fn start_process<F>(
    kernel: Arc<Kernel>,
    tid: Tid,
    cmd: String,
    back_ref: Weak<ExitStatus>,
    start: Arc<StartStatus>,
    user_main: F,
) where
    F: FnOnce(&Arc<Process>, LoadInfo) -> i32 + Send + 'static,
{
    // Parse the command line again, on this side of the handoff.
    let tokens = tokenize(&cmd);
    let name = tokens[0].clone();

    let process = Arc::new(Process {
        kernel: Arc::clone(&kernel),
        tid,
        name: name.clone(),
        mm: AddressSpace::new(),
        files: SpinLock::new(FileTable::new()),
        exec_file: SpinLock::new(None),
        children: SpinLock::new(Vec::new()),
        exit_status: SpinLock::new(Some(back_ref)),
        is_user: AtomicBool::new(false),
        exited: AtomicBool::new(false),
    });
    process.activate();

    let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    match loader::load(&kernel, &process.mm, &name, &token_refs) {
        Ok(info) => {
            // Keep the image open and write-denied for the process
            // lifetime.
            if let Ok(image) = kernel.fs.open(&name) {
                image.deny_write();
                let mut exec = process.exec_file.lock();
                *exec = Some(image);
                exec.unlock();
            }
            process.is_user.store(true, Ordering::Release);
            start.success.store(true, Ordering::Release);
            start.sema.up();

            // "Enter user mode." A panic in the user body is a fatal
            // fault: the process exits with -1, nothing else dies.
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                user_main(&process, info)
            }))
            .unwrap_or(-1);
            process.exit(code);
        }
        Err(e) => {
            start.errno.store(e.into_isize(), Ordering::Release);
            start.success.store(false, Ordering::Release);
            start.sema.up();
            process.exit(-1);
        }
    }
}
