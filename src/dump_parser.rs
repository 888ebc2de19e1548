use std::{borrow::Cow, collections::HashMap, fmt::Debug, io::BufRead};

use compact_str::CompactString;
use quick_xml::events::{BytesEnd, BytesStart};

// list of all tags that are relevant for our use case
// i.e. the tags of which we need a value and their parent tags
#[derive(Debug, Clone, PartialEq, Eq)]
enum Tag {
    MediaWiki,  // <mediawiki version="0.11" ...other attributes>...</mediawiki> is the root tag
    SiteInfo, // <siteinfo><dbname>...</dbname><namespaces>...</namespaces> ...other tags</siteinfo>
    DbName,   // <dbname>nlwiki</dbname>
    Namespaces, // <namespaces><namespace key="0" /> ...more namespace tags</namespaces>
    Namespace(Option<i32>), // <namespace key="1">Overleg</namespace>, None if the key is missing/invalid
    Page,      // <page>...tags are (title, ns, id, revision)</page>
    Title,     // <title>blah</title>
    Ns,        // <ns>0</ns>
    Id,        // <id>500</id>
    Revision,  // <revision>...tags are (id, timestamp, text, ...)</revision>
    Timestamp, // <timestamp>2003-12-05T06:41:50Z</timestamp>
    Text(bool), // <text bytes="20">blah</text> or <text deleted="deleted" />, bool is the deleted flag
    Unknown(CompactString), // any other tag, kept by name so the closing tag can be matched
}

impl Tag {
    fn from_start_bytes(e: &BytesStart) -> Result<Self, quick_xml::Error> {
        match e.name().as_ref() {
            b"mediawiki" => Ok(Tag::MediaWiki),
            b"siteinfo" => Ok(Tag::SiteInfo),
            b"dbname" => Ok(Tag::DbName),
            b"namespaces" => Ok(Tag::Namespaces),
            b"namespace" => {
                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;

                    if attr.key.as_ref() == b"key" {
                        let key = attr.unescape_value()?;
                        return Ok(Tag::Namespace(key.parse().ok()));
                    }
                }

                Ok(Tag::Namespace(None))
            }
            b"page" => Ok(Tag::Page),
            b"title" => Ok(Tag::Title),
            b"ns" => Ok(Tag::Ns),
            b"id" => Ok(Tag::Id),
            b"revision" => Ok(Tag::Revision),
            b"timestamp" => Ok(Tag::Timestamp),
            b"text" => {
                let mut deleted = false;

                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    if attr.key.as_ref() == b"deleted" {
                        deleted = true;
                    }
                }

                Ok(Tag::Text(deleted))
            }
            name => Ok(Tag::Unknown(CompactString::from(
                String::from_utf8_lossy(name).as_ref(),
            ))),
        }
    }

    fn matches_end_bytes(&self, e: &BytesEnd) -> bool {
        match (self, e.name().as_ref()) {
            (Tag::MediaWiki, b"mediawiki") => true,
            (Tag::SiteInfo, b"siteinfo") => true,
            (Tag::DbName, b"dbname") => true,
            (Tag::Namespaces, b"namespaces") => true,
            (Tag::Namespace(_), b"namespace") => true,
            (Tag::Page, b"page") => true,
            (Tag::Title, b"title") => true,
            (Tag::Ns, b"ns") => true,
            (Tag::Id, b"id") => true,
            (Tag::Revision, b"revision") => true,
            (Tag::Timestamp, b"timestamp") => true,
            (Tag::Text(_), b"text") => true,
            (Tag::Unknown(expected), name) => *expected == String::from_utf8_lossy(name),
            _ => false,
        }
    }
}

/// Full article text of a revision.
///
/// Suppressed revisions appear in dumps as `<text deleted="deleted" />`; their
/// text is unavailable, which is not the same as an empty string.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Text {
    Normal(String),
    Deleted,
}

impl Text {
    pub fn len(&self) -> usize {
        match self {
            Text::Normal(text) => text.len(),
            Text::Deleted => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Text::Normal(text) => text.is_empty(),
            Text::Deleted => true,
        }
    }
}

impl Debug for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Text::Normal(text) => write!(f, "{:?}", text),
            Text::Deleted => write!(f, "Deleted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub id: i32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub text: Text,
}

#[derive(Debug)]
struct RevisionBuilder {
    id: Option<i32>,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    text: Option<Text>,
}

impl RevisionBuilder {
    fn new() -> Self {
        Self {
            id: None,
            timestamp: None,
            text: None,
        }
    }

    fn try_build(self) -> Result<Revision, &'static str> {
        let Some(id) = self.id else {
            return Err("id");
        };
        let Some(timestamp) = self.timestamp else {
            return Err("timestamp");
        };
        let Some(text) = self.text else {
            return Err("text");
        };

        Ok(Revision {
            id,
            timestamp,
            text,
        })
    }
}

/// One article with its full revision history, oldest revision first
/// (dump order).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Page {
    pub title: CompactString,
    pub namespace: i32,
    pub revisions: Vec<Revision>,
}

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub enum Namespace {
    #[default]
    Default,
    Named(CompactString),
}

impl Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Default => write!(f, "Default"),
            Namespace::Named(name) => write!(f, "{:?}", name),
        }
    }
}

#[derive(Debug)]
pub struct SiteInfo {
    pub dbname: CompactString,
    pub namespaces: HashMap<i32, Namespace>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParsingError {
    #[error("XML error")]
    Xml(#[from] quick_xml::Error),
    #[error("unexpected end of file")]
    Eof,
    #[error("malformed dump structure")]
    Malformed,
}

/// Anything that yields a lazy, finite, forward-only sequence of [`Page`]s.
///
/// The scan pipeline only consumes this interface, it never touches the XML
/// layer directly.
pub trait PageSource {
    fn next_page(&mut self) -> Result<Option<Page>, ParsingError>;
}

/// Streaming parser for MediaWiki `pages-meta-history` XML dumps.
///
/// Pulls one [`Page`] at a time from the underlying reader, so memory usage is
/// bounded by the largest single page, not the dump. The `<siteinfo>` header
/// is parsed eagerly on construction.
///
/// The parser tries to recover from format damage (unknown tags, unbalanced
/// end tags, revisions with missing fields) by logging and skipping. With the
/// `strict` cargo feature enabled such damage aborts the parse instead.
pub struct DumpParser<R: BufRead> {
    xml: quick_xml::Reader<R>,
    buf: Vec<u8>,
    current_path: Vec<Tag>,
    site_info: SiteInfo,
}

impl<R: BufRead> Debug for DumpParser<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpParser")
            .field("buf.len", &self.buf.len())
            .field("buf.capacity", &self.buf.capacity())
            .field("current_path", &self.current_path)
            .field("site_info", &self.site_info)
            .finish()
    }
}

impl<R: BufRead> DumpParser<R> {
    pub fn new(reader: R) -> Result<Self, ParsingError> {
        let xml = quick_xml::Reader::from_reader(reader);
        // expand_empty_elements not set, take care to handle empty elements!

        let mut new = Self {
            xml,
            // preallocate 1 MiB for the buffer
            buf: Vec::with_capacity(1024 * 1024),
            current_path: Vec::new(),
            site_info: SiteInfo {
                dbname: CompactString::default(),
                namespaces: HashMap::new(),
            },
        };

        new.parse_site_info()?;

        Ok(new)
    }

    pub fn site_info(&self) -> &SiteInfo {
        &self.site_info
    }

    /// Pops the expected tag for an end event and reports mismatches.
    ///
    /// Returns `None` if the end tag had no corresponding start tag.
    ///
    /// Associated function taking the fields it needs, the end event still
    /// borrows the read buffer at every call site.
    fn check_end_tag(
        e: &BytesEnd,
        current_path: &mut Vec<Tag>,
        xml: &quick_xml::Reader<R>,
    ) -> Result<Option<Tag>, ParsingError> {
        let Some(tag) = current_path.pop() else {
            tracing::error!(
                message = "Unexpected end tag",
                tag = String::from_utf8_lossy(e.name().as_ref()).as_ref(),
                position = xml.buffer_position()
            );

            if cfg!(feature = "strict") {
                return Err(ParsingError::Malformed);
            } else {
                tracing::warn!("Ignoring unexpected end tag. This may lead to incorrect results.");
                return Ok(None);
            }
        };

        if !tag.matches_end_bytes(e) {
            tracing::error!(
                message = "Mismatched tags",
                expected = ?tag,
                actual = String::from_utf8_lossy(e.name().as_ref()).as_ref(),
                current_path = ?current_path,
                position = xml.buffer_position()
            );

            if cfg!(feature = "strict") {
                return Err(ParsingError::Malformed);
            } else {
                // either this closing tag has no corresponding opening tag, or an
                // opening tag was never closed; the cases cannot be told apart
                // here, so continue with the popped tag
                tracing::warn!("Ignoring mismatched tag. This may lead to incorrect results.");
            }
        }

        Ok(Some(tag))
    }

    fn parse_site_info(&mut self) -> Result<(), ParsingError> {
        let mut site_info = SiteInfo {
            dbname: CompactString::default(),
            namespaces: HashMap::new(),
        };

        loop {
            match self.xml.read_event_into(&mut self.buf)? {
                quick_xml::events::Event::Start(ref e) => {
                    let tag = Tag::from_start_bytes(e)?;
                    self.current_path.push(tag);
                }
                quick_xml::events::Event::Empty(ref e) => {
                    let tag = Tag::from_start_bytes(e)?;

                    use Tag::*;

                    self.current_path.push(tag);
                    if let [MediaWiki, SiteInfo, Namespaces, Namespace(key)] =
                        self.current_path.as_slice()
                    {
                        match key {
                            Some(key) => {
                                site_info.namespaces.insert(*key, self::Namespace::Default);
                            }
                            None => tracing::warn!(
                                message = "Ignoring namespace with missing or invalid key",
                                position = self.xml.buffer_position()
                            ),
                        }
                    }
                    self.current_path.pop();
                }
                quick_xml::events::Event::Text(e) => {
                    let text = e.unescape()?;

                    use Tag::*;

                    match self.current_path.as_slice() {
                        [MediaWiki, SiteInfo, DbName] => {
                            site_info.dbname = CompactString::from(text.as_ref());
                        }
                        [MediaWiki, SiteInfo, Namespaces, Namespace(key)] => match key {
                            Some(key) => {
                                site_info.namespaces.insert(
                                    *key,
                                    self::Namespace::Named(CompactString::from(text.as_ref())),
                                );
                            }
                            None => tracing::warn!(
                                message = "Ignoring namespace with missing or invalid key",
                                name = text.as_ref(),
                                position = self.xml.buffer_position()
                            ),
                        },
                        _ => {}
                    }
                }
                quick_xml::events::Event::End(ref e) => {
                    let tag = Self::check_end_tag(e, &mut self.current_path, &self.xml)?;

                    if tag == Some(Tag::SiteInfo) {
                        // found the closing tag for siteinfo, we're done
                        break;
                    }
                }
                quick_xml::events::Event::Eof => {
                    // a well-formed dump always closes siteinfo before the pages
                    tracing::error!(partial_site_info = ?site_info, current_path = ?self.current_path);
                    return Err(ParsingError::Eof);
                }
                _ => {}
            }
            self.buf.clear();
        }

        self.site_info = site_info;
        Ok(())
    }

    /// Parses the next `<page>` element, or `None` once the dump is exhausted.
    pub fn parse_page(&mut self) -> Result<Option<Page>, ParsingError> {
        let mut page = Page {
            title: CompactString::default(),
            namespace: 0,
            revisions: Vec::new(),
        };
        let mut started_page = false;

        let mut revision_builder = None;

        loop {
            match self.xml.read_event_into(&mut self.buf)? {
                quick_xml::events::Event::Start(ref e) => {
                    let tag = Tag::from_start_bytes(e)?;

                    if tag == Tag::Page {
                        started_page = true;
                    }

                    if tag == Tag::Revision {
                        revision_builder = Some(RevisionBuilder::new());
                    }

                    self.current_path.push(tag);
                }
                quick_xml::events::Event::Empty(ref e) => {
                    let tag = Tag::from_start_bytes(e)?;

                    self.current_path.push(tag);

                    use Tag::*;

                    if let [MediaWiki, Page, Revision, Text(deleted)] = self.current_path.as_slice()
                    {
                        if let Some(revision_builder) = &mut revision_builder {
                            revision_builder.text = Some(if *deleted {
                                self::Text::Deleted
                            } else {
                                self::Text::Normal(String::new())
                            });
                        }
                    }
                    self.current_path.pop();
                }
                quick_xml::events::Event::Text(e) => {
                    let text = e.unescape()?;

                    use Tag::*;

                    match self.current_path.as_slice() {
                        // Page tags
                        [MediaWiki, Page, Title] => {
                            fn normalize_title(title: &str) -> Cow<'_, str> {
                                if title.contains('_') {
                                    title.replace('_', " ").into()
                                } else {
                                    title.into()
                                }
                            }

                            if let Some((_, title)) = text.split_once(':') {
                                // split off the namespace prefix
                                page.title = CompactString::from(normalize_title(title));
                            } else {
                                page.title = CompactString::from(normalize_title(&text));
                            }
                        }
                        [MediaWiki, Page, Ns] => {
                            page.namespace = if let Ok(ns) = text.parse() {
                                ns
                            } else {
                                tracing::warn!(
                                    message = "Found invalid namespace id, defaulting to 0",
                                    ns = text.as_ref(),
                                    position = self.xml.buffer_position()
                                );
                                0
                            };
                        }
                        // Revision tags
                        [MediaWiki, Page, Revision, Id] => {
                            if let Some(revision_builder) = &mut revision_builder {
                                revision_builder.id = if let Ok(id) = text.parse() {
                                    Some(id)
                                } else {
                                    tracing::warn!(
                                        message =
                                            "Found invalid revision id, dropping the revision",
                                        id = text.as_ref(),
                                        position = self.xml.buffer_position()
                                    );
                                    None
                                };
                            }
                        }
                        [MediaWiki, Page, Revision, Timestamp] => {
                            // Source: https://github.com/mediawiki-utilities/python-mwtypes/blob/523a93f98fe1372938fc15872b5abb1f267cc643/mwtypes/timestamp.py#L12
                            const TIMESTAMP_FORMAT_LONG: &str = "%Y-%m-%dT%H:%M:%SZ";
                            const TIMESTAMP_FORMAT_SHORT: &str = "%Y%m%d%H%M%S";

                            if let Some(revision_builder) = &mut revision_builder {
                                revision_builder.timestamp = if let Ok(timestamp) =
                                    chrono::NaiveDateTime::parse_from_str(
                                        text.as_ref(),
                                        TIMESTAMP_FORMAT_SHORT,
                                    )
                                    .or_else(|_| {
                                        chrono::NaiveDateTime::parse_from_str(
                                            text.as_ref(),
                                            TIMESTAMP_FORMAT_LONG,
                                        )
                                    })
                                    .map(|dt| {
                                        chrono::DateTime::from_naive_utc_and_offset(dt, chrono::Utc)
                                    }) {
                                    Some(timestamp)
                                } else {
                                    tracing::warn!(
                                        message = "Found invalid revision timestamp",
                                        timestamp = text.as_ref(),
                                        position = self.xml.buffer_position()
                                    );
                                    None
                                };
                            }
                        }
                        [MediaWiki, Page, Revision, Text(deleted)] => {
                            if let Some(revision_builder) = &mut revision_builder {
                                revision_builder.text = Some(if *deleted {
                                    self::Text::Deleted
                                } else {
                                    self::Text::Normal(text.into_owned())
                                });
                            }
                        }
                        _ => {}
                    }
                }
                quick_xml::events::Event::End(ref e) => {
                    let tag = Self::check_end_tag(e, &mut self.current_path, &self.xml)?;

                    if let Some(Tag::Text(deleted)) = tag {
                        // <text></text> produces no text event
                        if let Some(revision_builder) = &mut revision_builder {
                            if revision_builder.text.is_none() {
                                revision_builder.text = Some(if deleted {
                                    Text::Deleted
                                } else {
                                    Text::Normal(String::new())
                                });
                            }
                        }
                    }

                    if tag == Some(Tag::Revision) {
                        if let Some(revision_builder) = revision_builder.take() {
                            match revision_builder.try_build() {
                                Ok(revision) => page.revisions.push(revision),
                                Err(field) => {
                                    tracing::error!(
                                        message = "Missing mandatory field in revision",
                                        field,
                                        page = page.title.as_str(),
                                        revision_end_position = self.xml.buffer_position()
                                    );
                                    if cfg!(feature = "strict") {
                                        return Err(ParsingError::Malformed);
                                    } else {
                                        tracing::warn!(
                                            "Ignoring revision with missing mandatory field"
                                        );
                                        continue;
                                    }
                                }
                            }
                        }
                    }

                    if tag == Some(Tag::Page) {
                        break;
                    }
                }
                quick_xml::events::Event::Eof => {
                    if started_page {
                        tracing::error!(partial_page = ?page, current_path = ?self.current_path);
                        return Err(ParsingError::Eof);
                    } else {
                        return Ok(None);
                    }
                }
                _ => {}
            }
            self.buf.clear();
        }

        Ok(Some(page))
    }
}

impl<R: BufRead> PageSource for DumpParser<R> {
    fn next_page(&mut self) -> Result<Option<Page>, ParsingError> {
        self.parse_page()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const SITE_INFO: &str = "\
<mediawiki xmlns=\"http://www.mediawiki.org/xml/export-0.11/\" version=\"0.11\">
  <siteinfo>
    <sitename>Wikipedia</sitename>
    <dbname>nlwiki</dbname>
    <namespaces>
      <namespace key=\"-1\">Speciaal</namespace>
      <namespace key=\"0\" />
      <namespace key=\"1\">Overleg</namespace>
    </namespaces>
  </siteinfo>
";

    fn parser_for(pages: &str) -> DumpParser<Cursor<String>> {
        let xml = format!("{SITE_INFO}{pages}</mediawiki>");
        DumpParser::new(Cursor::new(xml)).expect("site info should parse")
    }

    #[test]
    fn parses_site_info() {
        let parser = parser_for("");

        let site_info = parser.site_info();
        assert_eq!(site_info.dbname, "nlwiki");
        assert_eq!(site_info.namespaces.len(), 3);
        assert_eq!(site_info.namespaces[&0], Namespace::Default);
        assert_eq!(site_info.namespaces[&1], Namespace::Named("Overleg".into()));
    }

    #[test]
    fn parses_page_with_revisions() {
        let mut parser = parser_for(
            "<page>
                <title>Aardbei</title>
                <ns>0</ns>
                <id>17</id>
                <revision>
                  <id>100</id>
                  <timestamp>2004-01-01T12:00:00Z</timestamp>
                  <text bytes=\"15\">{{beginnetje}}</text>
                </revision>
                <revision>
                  <id>101</id>
                  <timestamp>2004-02-01T12:00:00Z</timestamp>
                  <text bytes=\"9\">full text</text>
                </revision>
              </page>",
        );

        let page = parser.parse_page().unwrap().expect("one page");
        assert_eq!(page.title, "Aardbei");
        assert_eq!(page.namespace, 0);
        assert_eq!(page.revisions.len(), 2);
        assert_eq!(page.revisions[0].id, 100);
        assert_eq!(
            page.revisions[0].text,
            Text::Normal("{{beginnetje}}".into())
        );
        assert_eq!(page.revisions[1].id, 101);
        assert!(page.revisions[0].timestamp < page.revisions[1].timestamp);

        assert!(parser.parse_page().unwrap().is_none());
    }

    #[test]
    fn strips_namespace_prefix_from_title() {
        let mut parser = parser_for(
            "<page>
                <title>Overleg:Aardbei_plant</title>
                <ns>1</ns>
                <id>18</id>
              </page>",
        );

        let page = parser.parse_page().unwrap().expect("one page");
        assert_eq!(page.title, "Aardbei plant");
        assert_eq!(page.namespace, 1);
    }

    #[test]
    fn deleted_text_is_surfaced_not_skipped() {
        let mut parser = parser_for(
            "<page>
                <title>Verwijderd</title>
                <ns>0</ns>
                <id>19</id>
                <revision>
                  <id>200</id>
                  <timestamp>2004-01-01T12:00:00Z</timestamp>
                  <text deleted=\"deleted\" />
                </revision>
              </page>",
        );

        let page = parser.parse_page().unwrap().expect("one page");
        assert_eq!(page.revisions.len(), 1);
        assert_eq!(page.revisions[0].text, Text::Deleted);
    }

    #[test]
    fn empty_text_element_is_empty_string() {
        let mut parser = parser_for(
            "<page>
                <title>Leeg</title>
                <ns>0</ns>
                <id>20</id>
                <revision>
                  <id>201</id>
                  <timestamp>2004-01-01T12:00:00Z</timestamp>
                  <text></text>
                </revision>
              </page>",
        );

        let page = parser.parse_page().unwrap().expect("one page");
        assert_eq!(page.revisions[0].text, Text::Normal(String::new()));
    }

    #[test]
    #[cfg(not(feature = "strict"))]
    fn revision_without_id_is_dropped() {
        let mut parser = parser_for(
            "<page>
                <title>Kapot</title>
                <ns>0</ns>
                <id>21</id>
                <revision>
                  <timestamp>2004-01-01T12:00:00Z</timestamp>
                  <text>no id on this one</text>
                </revision>
                <revision>
                  <id>301</id>
                  <timestamp>2004-02-01T12:00:00Z</timestamp>
                  <text>fine</text>
                </revision>
              </page>",
        );

        let page = parser.parse_page().unwrap().expect("one page");
        assert_eq!(page.revisions.len(), 1);
        assert_eq!(page.revisions[0].id, 301);
    }

    #[test]
    fn short_timestamp_format_is_accepted() {
        let mut parser = parser_for(
            "<page>
                <title>Oud</title>
                <ns>0</ns>
                <id>22</id>
                <revision>
                  <id>400</id>
                  <timestamp>20040101120000</timestamp>
                  <text>x</text>
                </revision>
              </page>",
        );

        let page = parser.parse_page().unwrap().expect("one page");
        assert_eq!(
            page.revisions[0].timestamp,
            chrono::DateTime::parse_from_rfc3339("2004-01-01T12:00:00Z").unwrap()
        );
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let mut parser = parser_for(
            "<page>
                <title>Vreemd</title>
                <ns>0</ns>
                <id>23</id>
                <discussionthreadinginfo>ignored</discussionthreadinginfo>
                <revision>
                  <id>500</id>
                  <timestamp>2004-01-01T12:00:00Z</timestamp>
                  <contributor><username>Piet</username><id>7</id></contributor>
                  <text>x</text>
                </revision>
              </page>",
        );

        let page = parser.parse_page().unwrap().expect("one page");
        assert_eq!(page.revisions.len(), 1);
        assert_eq!(page.revisions[0].id, 500);
    }

    #[test]
    fn eof_mid_page_is_an_error() {
        let xml = format!("{SITE_INFO}<page><title>Afgebroken</title><ns>0</ns>");
        let mut parser = DumpParser::new(Cursor::new(xml)).unwrap();

        assert!(parser.parse_page().is_err());
    }
}
