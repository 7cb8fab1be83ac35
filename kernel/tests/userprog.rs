//! End-to-end tests of ELF loading and argument passing.

mod common;

use common::{ElfBuilder, PAGE_SIZE, boot, trivial_program};
use nox::{
    KernelError,
    addressing::{PHYS_BASE, Va},
    process::Process,
};

fn read_word(p: &std::sync::Arc<Process>, va: Va) -> u32 {
    let mut buf = [0u8; 4];
    p.read_memory(va, &mut buf).unwrap();
    u32::from_le_bytes(buf)
}

fn read_cstr(p: &std::sync::Arc<Process>, va: Va) -> String {
    let mut out = Vec::new();
    let mut at = va;
    loop {
        let mut b = [0u8; 1];
        p.read_memory(at, &mut b).unwrap();
        if b[0] == 0 {
            break;
        }
        out.push(b[0]);
        at = at + 1usize;
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn argv_layout() {
    let kernel = boot(16, 0, &[("echo", &trivial_program())]);
    let root = Process::launch(&kernel, "main");
    let (tx, rx) = std::sync::mpsc::channel();

    let tid = root
        .execute_with("echo x y", move |p, info| {
            // Ascending from the initial stack pointer: fake return
            // address, argc, argv, the argv array, then the strings.
            let sp = info.sp;
            assert_eq!(read_word(p, sp), 0, "fake return address");
            let argc = read_word(p, sp + 4);
            let argv = read_word(p, sp + 8) as usize;
            assert_eq!(argc, 3);
            assert_eq!(argv, (sp + 12).into_usize(), "argv points at argv[0]");

            let argv = Va::new(argv).unwrap();
            let args: Vec<String> = (0..argc as usize)
                .map(|i| {
                    let ptr = read_word(p, argv + i * 4) as usize;
                    read_cstr(p, Va::new(ptr).unwrap())
                })
                .collect();
            assert_eq!(args, ["echo", "x", "y"]);
            assert_eq!(
                read_word(p, argv + 3 * 4),
                0,
                "argv[argc] is the null sentinel"
            );

            // The whole image fits between sp and the top of the stack.
            assert_eq!(PHYS_BASE - sp.into_usize(), 40);
            tx.send(()).unwrap();
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);
    rx.recv().expect("user body ran");
}

#[test]
fn entry_point_comes_from_the_header() {
    let kernel = boot(16, 0, &[("prog", &trivial_program())]);
    let root = Process::launch(&kernel, "main");
    let tid = root
        .execute_with("prog", |_, info| {
            assert_eq!(info.entry.into_usize(), 0x0804_8000);
            assert!(info.sp.into_usize() < PHYS_BASE);
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);
}

#[test]
fn loaded_pages_match_the_file() {
    // Two pages of recognizable code plus a bss tail.
    let mut text = vec![0u8; 2 * PAGE_SIZE];
    for (i, b) in text.iter_mut().enumerate() {
        *b = (i % 249) as u8;
    }
    let image = ElfBuilder::new(0x0804_8000)
        .code(0x0804_8000, &text)
        .bss(0x0805_0000, 2)
        .build();
    let kernel = boot(16, 0, &[("prog", &image)]);
    let root = Process::launch(&kernel, "main");

    let tid = root
        .execute_with("prog", move |p, _| {
            let mut loaded = vec![0u8; 2 * PAGE_SIZE];
            p.read_memory(Va::new(0x0804_8000).unwrap(), &mut loaded).unwrap();
            assert_eq!(loaded, text, "text pages read back the file bytes");

            let mut bss = vec![0u8; 2 * PAGE_SIZE];
            p.read_memory(Va::new(0x0805_0000).unwrap(), &mut bss).unwrap();
            assert!(bss.iter().all(|&b| b == 0), "bss is zero-filled");
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);
}

#[test]
fn writing_the_text_segment_is_refused() {
    let kernel = boot(16, 0, &[("prog", &trivial_program())]);
    let root = Process::launch(&kernel, "main");
    let tid = root
        .execute_with("prog", |p, _| {
            let r = p.write_memory(Va::new(0x0804_8000).unwrap(), &[0]);
            assert_eq!(r, Err(KernelError::InvalidAccess));
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);
}

#[test]
fn deny_write_covers_the_process_lifetime() {
    let kernel = boot(16, 0, &[("prog", &trivial_program())]);
    let root = Process::launch(&kernel, "main");

    let tid = root
        .execute_with("prog", |p, _| {
            // The program writes to its own executable through write().
            let fd = p.open("prog").unwrap();
            assert_eq!(
                p.write(fd, b"clobber").unwrap(),
                0,
                "write to the running image must fail"
            );
            p.close(fd).unwrap();
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);

    // After exit the file is writable again.
    let file = kernel.fs.open("prog").unwrap();
    assert!(file.write_at(0, b"patched").unwrap() > 0);
    kernel.shutdown().unwrap();
}

#[test]
fn missing_and_malformed_executables_fail_the_exec() {
    let kernel = boot(16, 0, &[("garbage", b"this is not an ELF image")]);
    let root = Process::launch(&kernel, "main");

    assert_eq!(root.execute("no-such-file"), Err(KernelError::NoSuchEntry));
    assert_eq!(root.execute("garbage"), Err(KernelError::NoExec));
    assert_eq!(root.execute(""), Err(KernelError::InvalidArgument));
    assert_eq!(root.execute("    "), Err(KernelError::InvalidArgument));
}

#[test]
fn dynamic_segments_are_refused() {
    let mut image = ElfBuilder::new(0x0804_8000)
        .code(0x0804_8000, &[0x90; 16])
        .build();
    // Rewrite the segment type to PT_DYNAMIC.
    image[52..56].copy_from_slice(&2u32.to_le_bytes());
    let kernel = boot(16, 0, &[("dyn", &image)]);
    let root = Process::launch(&kernel, "main");
    assert_eq!(root.execute("dyn"), Err(KernelError::NoExec));
}

#[test]
fn oversized_argument_lists_are_refused() {
    let kernel = boot(16, 0, &[("prog", &trivial_program())]);
    let root = Process::launch(&kernel, "main");

    // The strings alone exceed one page.
    let arg = "a".repeat(200);
    let mut cmd = String::from("prog");
    for _ in 0..25 {
        cmd.push(' ');
        cmd.push_str(&arg);
    }
    assert_eq!(root.execute(&cmd), Err(KernelError::InvalidArgument));
}

#[test]
fn a_failed_exec_releases_its_memory() {
    let kernel = boot(16, 0, &[("garbage", b"not elf")]);
    let root = Process::launch(&kernel, "main");
    assert_eq!(root.execute("garbage"), Err(KernelError::NoExec));

    // The child signals the exec result before finishing its exit; give
    // the teardown a moment, then every frame must be back in the pool.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while kernel.frames.free_frames() != 16 {
        assert!(std::time::Instant::now() < deadline, "frames leaked");
        std::thread::yield_now();
    }
}
