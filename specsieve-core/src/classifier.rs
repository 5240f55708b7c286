use crate::citation::{CitationAllocator, CitationKind};
use crate::concurrency::RenderPool;
use crate::config::ExtractionConfig;
use crate::geometry;
use crate::ocr::gate::CaptionMatcher;
use crate::ocr::{OcrCandidate, OcrEngine, OcrGate, OcrGateSettings};
use crate::readers::StructureReader;
use crate::tables::clustering::ClusterSettings;
use crate::tables::{render_markdown, TableDetector};
use crate::types::*;
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::debug;

/// Turns one page of raw reader output into a `PageBundle`.
///
/// Discovery order is fixed: text blocks, then visual regions in reader order,
/// then tables, then OCR results. Citation counters are per kind, so the ids
/// of one kind never depend on how many of another kind a page has.
pub struct PageClassifier {
    tables: TableDetector,
    captions: CaptionMatcher,
    gate_settings: OcrGateSettings,
}

impl PageClassifier {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let settings = ClusterSettings {
            row_tolerance: config.row_tolerance,
            gap_floor: config.column_gap_floor,
            gap_multiplier: config.column_gap_multiplier,
            min_rows: config.min_table_rows,
            min_cols: config.min_table_cols,
        };
        Ok(Self {
            tables: TableDetector::new(settings, config.table_sweep),
            captions: CaptionMatcher::new(&config.caption_patterns)?,
            gate_settings: OcrGateSettings {
                dpi: config.dpi,
                threshold: config.ocr_confidence_threshold,
                language: config.ocr_language.clone(),
            },
        })
    }

    pub fn classify(
        &self,
        raw: &RawPage,
        reader: &dyn StructureReader,
        engine: &dyn OcrEngine,
        renders: &RenderPool,
    ) -> PageBundle {
        let page = raw.page;
        let mut allocator = CitationAllocator::new(page);
        let mut blocks: Vec<Block> = Vec::new();
        let mut citations: BTreeMap<String, Citation> = BTreeMap::new();
        let mut metadata = PageMetadata {
            width: raw.width,
            height: raw.height,
            ..Default::default()
        };

        // Text
        for text_block in &raw.text_blocks {
            let citation_id = allocator.next_citation_id(CitationKind::Text);
            let content = text_block.text();
            if !geometry::validate(&text_block.bbox) || content.is_empty() {
                debug!(page, %citation_id, "Discarding invalid text block");
                metadata.discarded_invalid += 1;
                continue;
            }
            citations.insert(
                citation_id.clone(),
                citation(&citation_id, page, text_block.bbox, CitationSource::Text, ContentType::Text),
            );
            blocks.push(Block {
                bbox: text_block.bbox,
                citation_id,
                payload: BlockPayload::Text {
                    markdown_slice: content.clone(),
                    content,
                },
            });
            metadata.text_blocks += 1;
        }
        let text_blocks: Vec<Block> = blocks.clone();

        // Pictures and vector graphics
        let mut candidates = Vec::new();
        for region in &raw.regions {
            let (kind, content_type) = match region.kind {
                RegionKind::Raster => (CitationKind::Picture, ContentType::Picture),
                RegionKind::Vector => (CitationKind::Graphics, ContentType::Graphics),
            };
            let citation_id = allocator.next_citation_id(kind);
            if !geometry::validate(&region.bbox) {
                debug!(page, %citation_id, "Discarding region with invalid bbox");
                metadata.discarded_invalid += 1;
                continue;
            }

            let payload = match region.kind {
                RegionKind::Raster => {
                    metadata.picture_blocks += 1;
                    BlockPayload::Picture {
                        image_ref: region
                            .image_ref
                            .clone()
                            .unwrap_or_else(|| format!("{}.png", citation_id)),
                        origin: reader.name().to_string(),
                    }
                }
                RegionKind::Vector => {
                    metadata.graphics_blocks += 1;
                    BlockPayload::Graphics {
                        origin: reader.name().to_string(),
                    }
                }
            };

            let mut cited = citation(&citation_id, page, region.bbox, CitationSource::Graphics, content_type);
            cited.file_reference = region.image_ref.clone();
            citations.insert(citation_id.clone(), cited);
            candidates.push(OcrCandidate {
                region_citation_id: citation_id.clone(),
                bbox: region.bbox,
            });
            blocks.push(Block {
                bbox: region.bbox,
                citation_id,
                payload,
            });
        }

        // Tables
        let recovery = self.tables.detect(raw);
        for table in recovery.tables {
            let citation_id = allocator.next_citation_id(CitationKind::Table);
            citations.insert(
                citation_id.clone(),
                citation(&citation_id, page, table.bbox, CitationSource::Text, ContentType::Table),
            );
            blocks.push(Block {
                bbox: table.bbox,
                citation_id: citation_id.clone(),
                payload: BlockPayload::Table {
                    table_ref: citation_id,
                    rendered_table: Some(render_markdown(&table.grid)),
                    detection: table.detection,
                },
            });
            metadata.table_blocks += 1;
        }
        metadata.tables = recovery.stats;

        // OCR over regions with no selectable text
        let span_boxes: Vec<BoundingBox> = raw.spans().map(|s| s.bbox).collect();
        let gate = OcrGate::new(reader, engine, renders, &self.gate_settings);
        let outcome = gate.run(
            page,
            &candidates,
            &span_boxes,
            &text_blocks,
            &self.captions,
            &mut allocator,
        );
        for result in &outcome.results {
            let mut cited = citation(
                &result.citation_id,
                page,
                result.bbox,
                CitationSource::Ocr,
                ContentType::Text,
            );
            cited.confidence = Some(result.confidence);
            citations.insert(result.citation_id.clone(), cited);
        }
        metadata.ocr = outcome.stats;

        let raw_text = text_blocks
            .iter()
            .filter_map(Block::text)
            .collect::<Vec<_>>()
            .join("\n");

        PageBundle {
            page,
            raw_text,
            blocks,
            ocr_results: outcome.results,
            citation_index: citations,
            metadata,
        }
    }
}

fn citation(
    citation_id: &str,
    page: u32,
    bbox: BoundingBox,
    source: CitationSource,
    content_type: ContentType,
) -> Citation {
    Citation {
        citation_id: citation_id.to_string(),
        page,
        bbox,
        source,
        confidence: None,
        content_type,
        file_reference: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OcrError;
    use crate::ocr::OcrToken;

    struct NoRender;

    impl StructureReader for NoRender {
        fn page_count(&self) -> u32 {
            1
        }
        fn read_page(&self, _page: u32) -> Result<RawPage> {
            anyhow::bail!("unused")
        }
        fn render_region(&self, _page: u32, _bbox: &BoundingBox, dpi: u32) -> Result<Bitmap, OcrError> {
            Ok(Bitmap { png: vec![], dpi })
        }
        fn name(&self) -> &str {
            "test"
        }
    }

    struct Confident;

    impl OcrEngine for Confident {
        fn recognize(&self, _bitmap: &Bitmap, _language: &str) -> Result<Vec<OcrToken>, OcrError> {
            Ok(vec![OcrToken::new("Pinout", 0.92)])
        }
        fn name(&self) -> &str {
            "confident"
        }
    }

    fn bb(x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
        BoundingBox::new(x0, y0, x1, y1)
    }

    fn raw_page() -> RawPage {
        RawPage {
            page: 4,
            width: 612.0,
            height: 792.0,
            text_blocks: vec![
                RawTextBlock {
                    bbox: bb(72.0, 72.0, 300.0, 90.0),
                    spans: vec![RawSpan {
                        text: "Figure 2 Connector".into(),
                        bbox: bb(72.0, 72.0, 300.0, 90.0),
                    }],
                },
                RawTextBlock {
                    // Invalid: consumes p4_txt2 but is discarded
                    bbox: bb(10.0, 10.0, 5.0, 20.0),
                    spans: vec![RawSpan {
                        text: "broken".into(),
                        bbox: bb(10.0, 10.0, 5.0, 20.0),
                    }],
                },
                RawTextBlock {
                    bbox: bb(72.0, 500.0, 300.0, 520.0),
                    spans: vec![RawSpan {
                        text: "Body text".into(),
                        bbox: bb(72.0, 500.0, 300.0, 520.0),
                    }],
                },
            ],
            regions: vec![
                RawRegion {
                    bbox: bb(72.0, 100.0, 300.0, 300.0),
                    kind: RegionKind::Raster,
                    image_ref: Some("connector.png".into()),
                },
                RawRegion {
                    // Covers the body text, so never OCR'd
                    bbox: bb(60.0, 490.0, 320.0, 530.0),
                    kind: RegionKind::Vector,
                    image_ref: None,
                },
            ],
            table_candidates: vec![],
        }
    }

    #[test]
    fn classifies_blocks_with_discovery_order_ids() {
        let classifier = PageClassifier::new(&ExtractionConfig::default()).unwrap();
        let renders = RenderPool::new(1).unwrap();
        let bundle = classifier.classify(&raw_page(), &NoRender, &Confident, &renders);

        let ids: Vec<&str> = bundle.blocks.iter().map(|b| b.citation_id.as_str()).collect();
        assert_eq!(ids, vec!["p4_txt1", "p4_txt3", "p4_img1", "p4_gfx1"]);
        assert_eq!(bundle.metadata.discarded_invalid, 1);
        assert_eq!(bundle.raw_text, "Figure 2 Connector\nBody text");

        assert_eq!(bundle.ocr_results.len(), 1);
        let ocr = &bundle.ocr_results[0];
        assert_eq!(ocr.citation_id, "p4_ocr1");
        assert_eq!(ocr.region_citation_id, "p4_img1");
        assert_eq!(ocr.associated_block_citation_id.as_deref(), Some("p4_txt1"));
        assert_eq!(bundle.metadata.ocr.skipped_text_overlap, 1);

        // 2 text + 1 picture + 1 graphics + 1 OCR
        assert_eq!(bundle.citation_index.len(), 5);
        assert_eq!(
            bundle.citation("p4_img1").and_then(|c| c.file_reference.as_deref()),
            Some("connector.png")
        );
        assert_eq!(bundle.citation("p4_ocr1").and_then(|c| c.confidence), Some(0.92));
    }
}
