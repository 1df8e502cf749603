#![allow(dead_code)]

use nachos::{
    addressing::{PAGE_SIZE, round_to_page},
    config::SystemConfigurationBuilder,
    fs::MemFileSystem,
    kernel::Kernel,
    userprog::noff::{NOFF_HEADER_SIZE, NoffHeader, Segment},
};
use std::sync::Arc;

/// A NOFF executable whose segments are packed from address zero: the code,
/// then the data starting on the next page.
pub fn noff_image(code: &[u8], init: &[u8], uninit: u32) -> Vec<u8> {
    let data_start = round_to_page(code.len()) as u32;
    let header = NoffHeader {
        code: Segment {
            virtual_addr: 0,
            in_file_addr: NOFF_HEADER_SIZE as u32,
            size: code.len() as u32,
        },
        init_data: Segment {
            virtual_addr: data_start,
            in_file_addr: (NOFF_HEADER_SIZE + code.len()) as u32,
            size: init.len() as u32,
        },
        uninit_data: Segment {
            virtual_addr: data_start + init.len() as u32,
            in_file_addr: 0,
            size: uninit,
        },
    };
    let mut image = header.to_bytes().to_vec();
    image.extend_from_slice(code);
    image.extend_from_slice(init);
    image
}

/// `len` bytes of recognizable content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

/// A program of `pages` pages of code and nothing else.
pub fn code_only(pages: usize) -> Vec<u8> {
    noff_image(&pattern(pages * PAGE_SIZE, 0x5a), &[], 0)
}

/// Configuration shared by the tests: silent, small stacks.
pub fn config() -> SystemConfigurationBuilder {
    SystemConfigurationBuilder::default()
        .quite(true)
        .user_stack_size(2 * PAGE_SIZE)
        .timer_interval(10)
}

/// Boot a kernel whose file system holds `files`.
pub fn boot(config: SystemConfigurationBuilder, files: &[(&str, Vec<u8>)]) -> Kernel {
    let fs = Arc::new(MemFileSystem::new());
    for (name, data) in files {
        fs.insert(name, data.clone());
    }
    Kernel::new(config.build().unwrap(), fs)
}
