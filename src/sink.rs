use std::io::{self, Write};

use json_writer::JSONObjectWriter;

use crate::detector::LabelEvent;

/// Serializes label events as line-delimited JSON records.
///
/// One self-contained object per line, no enclosing array, no header:
///
/// ```text
/// {"rev_id":43851,"label":"E"}
/// {"rev_id":44903,"label":"D"}
/// ```
///
/// Records are written in whatever order they arrive from the merged worker
/// stream.
pub struct LabelSink<W: Write> {
    writer: W,
    buf: String,
}

impl<W: Write> LabelSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: String::new(),
        }
    }

    pub fn write_event(&mut self, event: &LabelEvent) -> io::Result<()> {
        self.buf.clear();

        let mut record = JSONObjectWriter::new(&mut self.buf);
        record.value("rev_id", event.rev_id);
        record.value("label", event.label.as_str());
        record.end();

        self.buf.push('\n');
        self.writer.write_all(self.buf.as_bytes())
    }

    /// Flushes the underlying writer. Records written before a failure remain
    /// valid, every record is self-contained.
    pub fn finish(mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
