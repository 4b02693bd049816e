//! XML output with scope-balanced elements.
//!
//! `element` opens a tag, runs the closure for the children, and closes the
//! tag on the way out, so emitted documents are balanced by construction.

pub(crate) struct XmlWriter {
    buf: String,
}

impl XmlWriter {
    pub(crate) fn new() -> XmlWriter {
        XmlWriter {
            buf: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
        }
    }

    pub(crate) fn element<F>(&mut self, name: &str, f: F) -> crate::Result<()>
    where
        F: FnOnce(&mut XmlWriter) -> crate::Result<()>,
    {
        self.buf.push('<');
        self.buf.push_str(name);
        self.buf.push('>');
        f(self)?;
        self.buf.push_str("</");
        self.buf.push_str(name);
        self.buf.push('>');
        Ok(())
    }

    pub(crate) fn text(&mut self, data: &str) {
        for c in data.chars() {
            match c {
                '&' => self.buf.push_str("&amp;"),
                '<' => self.buf.push_str("&lt;"),
                '>' => self.buf.push_str("&gt;"),
                _ => self.buf.push(c),
            }
        }
    }

    // For content known to need no escaping (numbers, base64, datetimes).
    pub(crate) fn raw(&mut self, data: &str) {
        self.buf.push_str(data);
    }

    pub(crate) fn text_element(&mut self, name: &str, data: &str) -> crate::Result<()> {
        self.element(name, |w| {
            w.text(data);
            Ok(())
        })
    }

    pub(crate) fn raw_element(&mut self, name: &str, data: &str) -> crate::Result<()> {
        self.element(name, |w| {
            w.raw(data);
            Ok(())
        })
    }

    pub(crate) fn finish(self) -> String {
        self.buf
    }
}
