//! Storage regions and their pages.

use std::{ops::Range, rc::Rc};

use uthread_sys_mem::{ProtectedPage, alignment};

use super::TlsError;

/// The pages backing one thread's storage.
///
/// A page shared with another region is held through more than one `Rc`;
/// the page is unmapped when the last region holding it goes away.
#[derive(Debug)]
pub(crate) struct TlsRegion {
    size: usize,
    pages: Vec<Rc<ProtectedPage>>,
}

impl TlsRegion {
    /// Maps enough inaccessible pages for `size` bytes.
    pub(crate) fn new(size: usize) -> Result<Self, TlsError> {
        let pages = (0..alignment::pages_needed(size))
            .map(|_| ProtectedPage::new().map(Rc::new))
            .collect::<Result<_, _>>()?;

        Ok(Self { size, pages })
    }

    /// A region of the same size backed by the same pages.
    pub(crate) fn share(&self) -> Self {
        Self {
            size: self.size,
            pages: self.pages.clone(),
        }
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn page_addresses(&self) -> Vec<usize> {
        self.pages.iter().map(|page| page.addr()).collect()
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.pages.iter().any(|page| page.contains(addr))
    }

    pub(crate) fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), TlsError> {
        let span = self.span(offset, buf.len())?;
        let window = AccessWindow::open(self.pages.iter().map(|page| &**page))?;

        for chunk in chunks(span) {
            // SAFETY: The window keeps every page open, and this region holds
            // no other slice into them.
            let page = unsafe { self.pages[chunk.page].as_slice() };
            buf[chunk.buf].copy_from_slice(&page[chunk.in_page]);
        }

        window.close()
    }

    /// Writes `buf` at `offset`, first unsharing every page it touches.
    ///
    /// Returns how many pages were copied.
    pub(crate) fn write(&mut self, offset: usize, buf: &[u8]) -> Result<usize, TlsError> {
        let span = self.span(offset, buf.len())?;

        let mut copied = 0;
        for chunk in chunks(span.clone()) {
            if self.unshare(chunk.page)? {
                copied += 1;
            }
        }

        let window = AccessWindow::open(self.pages.iter().map(|page| &**page))?;
        for chunk in chunks(span) {
            // SAFETY: The window keeps every page open; the page is private to
            // this region now and no other slice into it is alive.
            let page = unsafe { self.pages[chunk.page].as_mut_slice() };
            page[chunk.in_page].copy_from_slice(&buf[chunk.buf]);
        }
        window.close()?;

        Ok(copied)
    }

    /// Byte range of an access, checked against the declared size.
    fn span(&self, offset: usize, len: usize) -> Result<Range<usize>, TlsError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(offset..end),
            _ => Err(TlsError::OutOfRange),
        }
    }

    /// Replaces page `index` by a private copy if another region shares it.
    fn unshare(&mut self, index: usize) -> Result<bool, TlsError> {
        let private = {
            let shared = &self.pages[index];
            if Rc::strong_count(shared) == 1 {
                return Ok(false);
            }

            let private = ProtectedPage::new()?;
            let window = AccessWindow::open([&**shared, &private])?;
            // SAFETY: Both pages are open; `private` is not shared yet and
            // nothing else views `shared` during the copy.
            unsafe { private.as_mut_slice().copy_from_slice(shared.as_slice()) };
            window.close()?;
            private
        };

        self.pages[index] = Rc::new(private);
        Ok(true)
    }
}

/// One piece of an access that stays inside a single page.
struct Chunk {
    page: usize,
    in_page: Range<usize>,
    buf: Range<usize>,
}

/// Splits a byte range of the region at page boundaries.
fn chunks(span: Range<usize>) -> impl Iterator<Item = Chunk> {
    let page_size = alignment::page_size();
    let start = span.start;
    let mut pos = span.start;

    std::iter::from_fn(move || {
        if pos >= span.end {
            return None;
        }
        let page = pos / page_size;
        let in_page = pos % page_size;
        let len = (page_size - in_page).min(span.end - pos);

        let chunk = Chunk {
            page,
            in_page: in_page..in_page + len,
            buf: pos - start..pos - start + len,
        };
        pos += len;
        Some(chunk)
    })
}

/// Keeps a set of pages readable and writable while alive.
///
/// Dropping the window closes the pages again; [`AccessWindow::close`] does
/// the same and reports failures.
struct AccessWindow<'a> {
    pages: Vec<&'a ProtectedPage>,
}

impl<'a> AccessWindow<'a> {
    fn open(pages: impl IntoIterator<Item = &'a ProtectedPage>) -> Result<Self, TlsError> {
        let mut window = Self { pages: Vec::new() };
        for page in pages {
            // On failure, the pages opened so far are closed by the drop.
            page.open()?;
            window.pages.push(page);
        }
        Ok(window)
    }

    fn close(mut self) -> Result<(), TlsError> {
        let mut result = Ok(());
        for page in self.pages.drain(..) {
            if let Err(err) = page.close() {
                result = result.and(Err(err.into()));
            }
        }
        result
    }
}

impl Drop for AccessWindow<'_> {
    fn drop(&mut self) {
        for page in &self.pages {
            let _ = page.close();
        }
    }
}
