use epubnav_core::{Cfi, SectionContent, TextNode, Viewport};

/// One laid out line: a slice of a text node, in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub node: usize,
    pub offset: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub lines: Vec<Line>,
}

impl Page {
    pub fn start_cfi(&self, spine_index: usize, nodes: &[TextNode]) -> Cfi {
        self.lines
            .iter()
            .find(|line| !line.text.is_empty())
            .and_then(|line| {
                let node = nodes.get(line.node)?;
                Some(node.cfi_at(spine_index, line.offset as u32))
            })
            .unwrap_or_else(|| Cfi::section_start(spine_index))
    }

    pub fn end_cfi(&self, spine_index: usize, nodes: &[TextNode]) -> Option<Cfi> {
        let line = self.lines.iter().rev().find(|line| !line.text.is_empty())?;
        let node = nodes.get(line.node)?;
        let end = line.offset + line.text.chars().count();
        Some(node.cfi_at(spine_index, end as u32))
    }

    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Splits plain text into paragraphs on blank lines. Lines inside a
/// paragraph are joined with single spaces.
pub fn paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }
    paragraphs
}

/// Greedy word wrap. Returns `(start, len)` character spans; words longer
/// than `width` are cut.
pub fn wrap(text: &str, width: usize) -> Vec<(usize, usize)> {
    let width = width.max(1);
    let mut words: Vec<(usize, usize)> = Vec::new();
    let mut start = None;
    let mut count = 0;
    for (i, c) in text.chars().enumerate() {
        count = i + 1;
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                words.push((s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push((s, count));
    }

    let mut lines = Vec::new();
    let mut line: Option<(usize, usize)> = None;
    for (mut word_start, word_end) in words {
        if let Some((line_start, line_end)) = line {
            if word_end - line_start <= width {
                line = Some((line_start, word_end));
                continue;
            }
            lines.push((line_start, line_end - line_start));
        }
        while word_end - word_start > width {
            lines.push((word_start, width));
            word_start += width;
        }
        line = Some((word_start, word_end));
    }
    if let Some((line_start, line_end)) = line {
        lines.push((line_start, line_end - line_start));
    }
    lines
}

/// Lays a section out into pages of `viewport.height` lines, each at most
/// `viewport.width` characters, with a blank line between paragraphs.
pub fn paginate(content: &SectionContent, viewport: Viewport) -> Vec<Page> {
    let width = viewport.width.max(1) as usize;
    let height = viewport.height.max(1) as usize;

    let mut lines: Vec<Line> = Vec::new();
    for (index, node) in content.nodes.iter().enumerate() {
        if node.text.trim().is_empty() {
            continue;
        }
        if !lines.is_empty() {
            lines.push(Line {
                node: index,
                offset: 0,
                text: String::new(),
            });
        }
        let chars: Vec<char> = node.text.chars().collect();
        for (start, len) in wrap(&node.text, width) {
            lines.push(Line {
                node: index,
                offset: start,
                text: chars[start..start + len].iter().collect(),
            });
        }
    }

    let mut pages: Vec<Page> = lines
        .chunks(height)
        .map(|chunk| {
            let mut lines = chunk.to_vec();
            while lines.first().is_some_and(|line| line.text.is_empty()) {
                lines.remove(0);
            }
            while lines.last().is_some_and(|line| line.text.is_empty()) {
                lines.pop();
            }
            Page { lines }
        })
        .filter(|page| !page.lines.is_empty())
        .collect();
    if pages.is_empty() {
        pages.push(Page::default());
    }
    pages
}

/// Index of the page showing `cfi`: the last page starting at or before it.
pub fn page_of(pages: &[Page], spine_index: usize, nodes: &[TextNode], cfi: &Cfi) -> usize {
    let target = cfi.start();
    pages
        .iter()
        .rposition(|page| page.start_cfi(spine_index, nodes) <= target)
        .unwrap_or(0)
}
