//! First-match extraction over streamed text output
//!
//! An [`OutputScanner`] buffers incoming chunks to line boundaries, runs an
//! extractor over each complete line and remembers the first hit. Once a
//! value has been found every further feed is ignored.

use regex::Regex;

/// Result of feeding the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan<T> {
    Found(T),
    NotFound,
}

impl<T> Scan<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Scan::Found(value) => Some(value),
            Scan::NotFound => None,
        }
    }
}

type Extractor<T> = Box<dyn FnMut(&str) -> Option<T> + Send>;

pub struct OutputScanner<T> {
    extractor: Extractor<T>,
    pending: Vec<u8>,
    found: bool,
}

impl<T> OutputScanner<T> {
    pub fn new<F>(extractor: F) -> Self
    where
        F: FnMut(&str) -> Option<T> + Send + 'static,
    {
        Self {
            extractor: Box::new(extractor),
            pending: Vec::new(),
            found: false,
        }
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Feed a raw chunk. Partial lines are held until their newline arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Scan<T> {
        if self.found {
            return Scan::NotFound;
        }
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            if let Scan::Found(value) = self.apply(text.trim_end_matches(['\r', '\n'])) {
                self.pending.clear();
                return Scan::Found(value);
            }
        }
        Scan::NotFound
    }

    /// Feed one already-complete line
    pub fn feed_line(&mut self, line: &str) -> Scan<T> {
        if self.found {
            return Scan::NotFound;
        }
        self.apply(line)
    }

    /// Flush a trailing partial line (end of stream)
    pub fn finish(&mut self) -> Scan<T> {
        if self.found || self.pending.is_empty() {
            return Scan::NotFound;
        }
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest);
        self.apply(text.trim_end_matches('\r'))
    }

    fn apply(&mut self, line: &str) -> Scan<T> {
        match (self.extractor)(line) {
            Some(value) => {
                self.found = true;
                Scan::Found(value)
            }
            None => Scan::NotFound,
        }
    }
}

/// Extractor yielding the first match of `pattern` in a line
pub fn regex_extractor(pattern: Regex) -> impl FnMut(&str) -> Option<String> + Send + 'static {
    move |line| pattern.find(line).map(|m| m.as_str().to_string())
}
