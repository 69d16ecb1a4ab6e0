use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Terminal output shared by the interpreter and the event listener.
///
/// Events arrive while the user is sitting at the prompt, so the writer tracks
/// whether a prompt is open and starts a fresh line before printing over it.
#[derive(Clone)]
pub struct Output {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    writer: Box<dyn Write + Send>,
    in_prompt: bool,
}

impl Output {
    pub fn new(writer: impl Write + Send + 'static) -> Output {
        Output {
            inner: Arc::new(Mutex::new(Inner {
                writer: Box::new(writer),
                in_prompt: false,
            })),
        }
    }

    pub fn stdout() -> Output {
        Output::new(io::stdout())
    }

    /// Prints one line of text
    pub fn line(&self, text: impl Display) {
        let mut inner = self.lock();
        if inner.in_prompt {
            let _ = writeln!(inner.writer);
            inner.in_prompt = false;
        }

        let _ = writeln!(inner.writer, "{}", text);
        let _ = inner.writer.flush();
    }

    /// Marks that a prompt is open on the current line. `line` breaks out of
    /// it before printing.
    pub fn prompt_opened(&self) {
        self.lock().in_prompt = true;
    }

    pub fn prompt_closed(&self) {
        self.lock().in_prompt = false;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking writer leaves nothing inconsistent behind
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
