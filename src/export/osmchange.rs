//! OsmChange (API 0.6) serialization.
//!
//! Every polygon becomes a closed way in a single `<create>` block. Nodes
//! and ways get negative placeholder ids, allocated from -1 in document
//! order, which editors replace on upload.

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use super::{ChangeDocument, ChangeSerializer, ExportBatch};
use crate::error::{Result, ReviewError};
use crate::geometry::Polygon;

pub const GENERATOR: &str = "osm-triage";

#[derive(Debug, Clone)]
pub struct OsmChangeSerializer {
    generator: String,
}

impl OsmChangeSerializer {
    pub fn new(generator: impl Into<String>) -> Self {
        Self {
            generator: generator.into(),
        }
    }
}

impl Default for OsmChangeSerializer {
    fn default() -> Self {
        Self::new(GENERATOR)
    }
}

impl ChangeSerializer for OsmChangeSerializer {
    fn name(&self) -> &'static str {
        "osmchange"
    }

    fn serialize(&self, batch: &ExportBatch) -> Result<ChangeDocument> {
        let failure = |e: quick_xml::Error| ReviewError::Serialize {
            format: self.name(),
            message: e.to_string(),
        };
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        let mut next_id: i64 = -1;

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(failure)?;
        let root = BytesStart::new("osmChange")
            .with_attributes([("version", "0.6"), ("generator", self.generator.as_str())]);
        writer.write_event(Event::Start(root)).map_err(failure)?;
        writer
            .write_event(Event::Start(BytesStart::new("create")))
            .map_err(failure)?;

        for (polygon, tags) in batch.pairs() {
            let node_ids = write_nodes(&mut writer, polygon, &mut next_id).map_err(failure)?;

            let way_id = next_id.to_string();
            next_id -= 1;
            let way = BytesStart::new("way")
                .with_attributes([("id", way_id.as_str()), ("version", "0")]);
            writer.write_event(Event::Start(way)).map_err(failure)?;
            // Repeat the first node to close the way.
            for node_id in node_ids.iter().chain(node_ids.first()) {
                let node_ref = node_id.to_string();
                let nd = BytesStart::new("nd").with_attributes([("ref", node_ref.as_str())]);
                writer.write_event(Event::Empty(nd)).map_err(failure)?;
            }
            for (k, v) in tags.iter() {
                let tag = BytesStart::new("tag").with_attributes([("k", k), ("v", v)]);
                writer.write_event(Event::Empty(tag)).map_err(failure)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("way")))
                .map_err(failure)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("create")))
            .map_err(failure)?;
        writer
            .write_event(Event::End(BytesEnd::new("osmChange")))
            .map_err(failure)?;

        let mut body =
            String::from_utf8(writer.into_inner()).map_err(|e| ReviewError::Serialize {
                format: self.name(),
                message: e.to_string(),
            })?;
        body.push('\n');

        Ok(ChangeDocument {
            body,
            feature_count: batch.len(),
        })
    }
}

fn write_nodes(
    writer: &mut Writer<Vec<u8>>,
    polygon: &Polygon,
    next_id: &mut i64,
) -> quick_xml::Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(polygon.ring().len());
    for v in polygon.ring() {
        let id = *next_id;
        *next_id -= 1;
        let id_attr = id.to_string();
        let (lat, lon) = (format!("{:.7}", v.lat), format!("{:.7}", v.lon));
        let node = BytesStart::new("node").with_attributes([
            ("id", id_attr.as_str()),
            ("version", "0"),
            ("lat", lat.as_str()),
            ("lon", lon.as_str()),
        ]);
        writer.write_event(Event::Empty(node))?;
        ids.push(id);
    }
    Ok(ids)
}
