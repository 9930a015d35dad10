//! sysroot-ls - list what a sysroot archive materializes
//!
//! Loads the archive into the native filesystem engine exactly as the
//! worker does at boot, then prints every node.
//!
//! Usage: sysroot-ls <archive.tar>

use std::error::Error;
use std::rc::Rc;
use webcc::bridge::Bridge;
use webcc::channel::BufferedChannel;
use webcc::vfs::{ArchiveLoader, HeapFsEngine, NodeKind, VirtualFileSystem};

fn main() -> Result<(), Box<dyn Error>> {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: sysroot-ls <archive.tar>");
        std::process::exit(2);
    };
    let data = std::fs::read(&path)?;

    let bridge = Rc::new(Bridge::new(Rc::new(BufferedChannel::new())));
    let engine = Rc::new(HeapFsEngine::new(bridge));
    let vfs = VirtualFileSystem::new(engine.clone());

    let mut loader = ArchiveLoader::new();
    let summary = loader.load(&data, &vfs)?;

    for (node, kind) in vfs.entries() {
        match kind {
            NodeKind::Directory => println!("d {:>10}  {}/", "-", node),
            NodeKind::File => {
                let size = vfs.get_file_contents(&node)?.len();
                println!("f {:>10}  {}", size, node);
            }
        }
    }

    println!(
        "{} files, {} directories, {} bytes ({} of {} archive bytes read, {} nodes)",
        summary.files,
        summary.directories,
        summary.bytes,
        loader.offset(),
        data.len(),
        engine.node_count()
    );
    Ok(())
}
