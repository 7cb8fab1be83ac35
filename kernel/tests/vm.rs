//! End-to-end tests of demand paging under memory pressure.

mod common;

use common::{ElfBuilder, PAGE_SIZE, boot};
use nox::{addressing::Va, process::Process};

#[test]
fn patterns_survive_eviction_to_swap() {
    // A 32-frame user pool and a program touching 128 distinct anonymous
    // pages: most of the working set must round-trip through swap.
    let image = ElfBuilder::new(0x0804_8000)
        .code(0x0804_8000, &[0x90; 32])
        .bss(0x1000_0000, 128)
        .build();
    let kernel = boot(32, 256, &[("hog", &image)]);
    let root = Process::launch(&kernel, "main");

    let pattern = |i: usize| {
        let mut page = vec![0u8; 64];
        for (j, b) in page.iter_mut().enumerate() {
            *b = ((i * 31 + j * 7) % 251) as u8;
        }
        page
    };

    let kernel2 = std::sync::Arc::clone(&kernel);
    let tid = root
        .execute_with("hog", move |p, _| {
            for i in 0..128 {
                let va = Va::new(0x1000_0000 + i * PAGE_SIZE).unwrap();
                p.write_memory(va, &pattern(i)).unwrap();
            }
            assert!(
                kernel2.swap.used_slots() > 0,
                "128 pages in 32 frames must push pages to swap"
            );
            for i in 0..128 {
                let va = Va::new(0x1000_0000 + i * PAGE_SIZE).unwrap();
                let mut buf = vec![0u8; 64];
                p.read_memory(va, &mut buf).unwrap();
                assert_eq!(buf, pattern(i), "page {i} recovered exactly");
            }
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);

    // The dead process owns nothing: no frames, no swap slots.
    assert_eq!(kernel.swap.used_slots(), 0);
    assert_eq!(kernel.frames.free_frames(), 32);
}

#[test]
fn code_pages_refault_from_the_image_under_pressure() {
    // Eight pages of text, a pool of four frames. Clean text pages are
    // dropped on eviction and re-read from the executable.
    let mut text = vec![0u8; 8 * PAGE_SIZE];
    for (i, b) in text.iter_mut().enumerate() {
        *b = (i / PAGE_SIZE) as u8 + 1;
    }
    let image = ElfBuilder::new(0x0804_8000)
        .code(0x0804_8000, &text)
        .build();
    let kernel = boot(4, 8, &[("prog", &image)]);
    let root = Process::launch(&kernel, "main");

    let kernel2 = std::sync::Arc::clone(&kernel);
    let tid = root
        .execute_with("prog", move |p, _| {
            for round in 0..3 {
                for i in 0..8usize {
                    let va = Va::new(0x0804_8000 + i * PAGE_SIZE).unwrap();
                    let mut buf = [0u8; 8];
                    p.read_memory(va, &mut buf).unwrap();
                    assert_eq!(buf, [i as u8 + 1; 8], "round {round}, page {i}");
                }
            }
            assert_eq!(
                kernel2.swap.used_slots(),
                0,
                "clean text never goes to swap"
            );
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);
}

#[test]
fn dirtied_data_pages_go_to_swap_not_the_image() {
    // A writable data segment initialized from the file: pages written by
    // the process must be preserved across eviction without modifying the
    // executable.
    let init = vec![0x42u8; 2 * PAGE_SIZE];
    let image = ElfBuilder::new(0x0804_8000)
        .code(0x0804_8000, &[0x90; 4 * PAGE_SIZE])
        .segment(common::Segment {
            vaddr: 0x0805_0000,
            data: init.clone(),
            memsz: 2 * PAGE_SIZE as u32,
            writable: true,
        })
        .build();
    let kernel = boot(3, 16, &[("prog", &image)]);
    let image_len = image.len();
    let root = Process::launch(&kernel, "main");

    let tid = root
        .execute_with("prog", move |p, _| {
            let data = Va::new(0x0805_0000).unwrap();
            // Dirty both data pages.
            p.write_memory(data, &[1u8; 8]).unwrap();
            p.write_memory(data + PAGE_SIZE, &[2u8; 8]).unwrap();
            // Thrash: force the data pages out through a pool of three.
            for i in 0..12usize {
                let va = Va::new(0x0804_8000 + (i % 4) * PAGE_SIZE).unwrap();
                let mut buf = [0u8; 4];
                p.read_memory(va, &mut buf).unwrap();
            }
            let mut buf = [0u8; 8];
            p.read_memory(data, &mut buf).unwrap();
            assert_eq!(buf, [1u8; 8]);
            p.read_memory(data + PAGE_SIZE, &mut buf).unwrap();
            assert_eq!(buf, [2u8; 8]);
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);

    // The executable on disk is untouched.
    let f = kernel.fs.open("prog").unwrap();
    assert_eq!(f.len(), image_len);
    let mut tail = vec![0u8; 2 * PAGE_SIZE];
    let data_ofs = image_len - 2 * PAGE_SIZE;
    f.read_at(data_ofs, &mut tail).unwrap();
    assert_eq!(tail, init, "private data pages never write back to the image");
}

#[test]
fn mmap_round_trips_through_the_file() {
    let image = ElfBuilder::new(0x0804_8000)
        .code(0x0804_8000, &[0x90; 16])
        .build();
    let kernel = boot(8, 0, &[("prog", &image), ("data", &[0u8; 2 * PAGE_SIZE])]);
    let root = Process::launch(&kernel, "main");

    let tid = root
        .execute_with("prog", |p, _| {
            let addr = Va::new(0x2000_0000).unwrap();
            let fd = p.open("data").unwrap();
            assert_eq!(p.mmap(fd, addr, 2 * PAGE_SIZE).unwrap(), 2 * PAGE_SIZE);
            p.write_memory(addr + 100, b"through the mapping").unwrap();
            p.munmap(addr, 2 * PAGE_SIZE).unwrap();
            p.close(fd).unwrap();
            0
        })
        .unwrap();
    assert_eq!(root.wait(tid), 0);

    let f = kernel.fs.open("data").unwrap();
    let mut buf = [0u8; 19];
    f.read_at(100, &mut buf).unwrap();
    assert_eq!(&buf, b"through the mapping");
}
