//! Flat field extraction for WeCom callback XML, and the encrypted
//! passive-reply envelope.

use std::collections::HashMap;

use quick_xml::{Reader, events::Event};

use qiao_channels::{Error, Result};

/// Collect `<Tag>text</Tag>` / `<Tag><![CDATA[text]]></Tag>` pairs from a
/// flat callback document. Nested structure is not needed: WeCom callback
/// bodies are one level deep.
pub fn parse_xml_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut output = HashMap::new();

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                current_tag =
                    Some(String::from_utf8_lossy(event.local_name().as_ref()).to_string());
            },
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = event
                        .unescape()
                        .map_err(|e| Error::external("callback xml text", e))?
                        .trim()
                        .to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            },
            Ok(Event::CData(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = String::from_utf8_lossy(event.as_ref()).trim().to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            },
            Ok(Event::End(_)) => {
                current_tag = None;
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::external("callback xml parse", e)),
            _ => {},
        }
        buffer.clear();
    }
    Ok(output)
}
