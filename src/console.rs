//! Terminal observer for the command-line host.

use picolink_repl::repl::{FsNode, SessionObserver};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// Prints device output to stdout and progress to stderr.
#[derive(Default)]
pub struct ConsoleObserver {
    /// Device output is only shown while a command wants it.
    show_output: AtomicBool,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self {
            show_output: AtomicBool::new(false),
        }
    }

    pub fn show_output(&self, on: bool) {
        self.show_output.store(on, Ordering::Relaxed);
    }
}

impl SessionObserver for ConsoleObserver {
    fn on_data(&self, text: &str) {
        if !self.show_output.load(Ordering::Relaxed) {
            tracing::trace!(target: "picolink::device", "{:?}", text);
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.replace('\x04', "").as_bytes());
        let _ = out.flush();
    }

    fn on_connect(&self, port_name: &str) {
        tracing::info!("connected to {}", port_name);
    }

    fn on_disconnect(&self, reason: &str) {
        tracing::info!("disconnected: {}", reason);
    }

    fn on_fs_snapshot(&self, tree: &FsNode) {
        tracing::debug!("filesystem snapshot: {} file(s)", tree.file_count());
    }

    fn on_progress(&self, percent: u8, label: &str) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{} {:>3}%", label, percent);
        if percent >= 100 {
            let _ = writeln!(err);
        }
        let _ = err.flush();
    }
}

/// Render a tree as an indented listing.
pub fn render_tree(tree: &FsNode) -> String {
    let mut out = String::from("/\n");
    render_children(tree, 1, &mut out);
    out
}

fn render_children(node: &FsNode, depth: usize, out: &mut String) {
    for child in node.children() {
        out.push_str(&"  ".repeat(depth));
        out.push_str(child.name());
        if child.is_dir() {
            out.push('/');
        }
        out.push('\n');
        render_children(child, depth + 1, out);
    }
}
