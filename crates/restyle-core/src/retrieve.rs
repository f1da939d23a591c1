//! Few-shot example retrieval.
//!
//! Ranks the stored examples by cosine similarity to a new text, projected
//! into the persisted vector space. Only example documents are compared.
//! Ties keep the examples' cluster order.

use anyhow::Result;
use serde::Serialize;

use crate::error::PipelineError;
use crate::models::Document;
use crate::store::Store;
use crate::vector::VectorSpaceModel;

/// One ranked example.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedExample {
    pub document_id: String,
    /// Position of the example in cluster order.
    pub cluster_rank: usize,
    pub similarity: f64,
}

/// Ranks examples against a persisted [`VectorSpaceModel`].
pub struct SimilarityRetriever<'a> {
    model: &'a VectorSpaceModel,
}

impl<'a> SimilarityRetriever<'a> {
    pub fn new(model: &'a VectorSpaceModel) -> Self {
        Self { model }
    }

    /// The `n` examples most similar to `text`, best first.
    ///
    /// `example_ids` must be in cluster order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::MissingArtifact`] if there are no examples or none
    /// of them is part of the model.
    pub fn rank(&self, text: &str, example_ids: &[String], n: usize) -> Result<Vec<RankedExample>> {
        if example_ids.is_empty() {
            return Err(PipelineError::missing("few-shot examples").into());
        }

        let query = self.model.transform(text);
        let mut ranked: Vec<RankedExample> = example_ids
            .iter()
            .enumerate()
            .filter_map(|(cluster_rank, id)| match self.model.vector_for(id) {
                Some(vector) => Some(RankedExample {
                    document_id: id.clone(),
                    cluster_rank,
                    similarity: query.cosine(vector),
                }),
                None => {
                    tracing::warn!(document_id = %id, "example is not in the vector model");
                    None
                }
            })
            .collect();

        if ranked.is_empty() {
            return Err(PipelineError::missing("example vectors").into());
        }

        // Stable: equal similarities keep cluster order.
        ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        ranked.truncate(n);
        Ok(ranked)
    }
}

/// Load the `n` example documents most similar to `text`, best first.
pub async fn find_similar_examples<S: Store + ?Sized>(
    store: &S,
    model: &VectorSpaceModel,
    text: &str,
    n: usize,
) -> Result<Vec<Document>> {
    let example_ids = store.get_example_document_ids().await?;
    let ranked = SimilarityRetriever::new(model).rank(text, &example_ids, n)?;
    let ids: Vec<String> = ranked.into_iter().map(|r| r.document_id).collect();
    store.get_documents_by_ids(&ids).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::models::Example;
    use crate::vector::VectorizerConfig;

    fn corpus() -> Vec<Document> {
        vec![
            Document::new("a", "Baking bread", "Flour yeast water and a hot oven.", None, vec![]),
            Document::new("b", "Fixing bikes", "Chains gears brakes and tyre levers.", None, vec![]),
            Document::new("c", "Night sky", "Telescopes planets comets and galaxies.", None, vec![]),
            Document::new("d", "Sourdough", "Starter flour water and patience.", None, vec![]),
        ]
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_text_ranks_first() {
        let docs = corpus();
        let model = VectorSpaceModel::fit(&docs, &VectorizerConfig::default()).unwrap();
        let retriever = SimilarityRetriever::new(&model);
        let ranked = retriever
            .rank(&docs[2].vector_text(), &ids(&["a", "b", "c"]), 1)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].document_id, "c");
        assert!((ranked[0].similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn only_examples_are_compared() {
        let docs = corpus();
        let model = VectorSpaceModel::fit(&docs, &VectorizerConfig::default()).unwrap();
        let ranked = SimilarityRetriever::new(&model)
            .rank(&docs[3].vector_text(), &ids(&["a", "b", "c"]), 3)
            .unwrap();
        assert!(ranked.iter().all(|r| r.document_id != "d"));
        assert_eq!(ranked[0].document_id, "a");
    }

    #[test]
    fn ties_keep_cluster_order() {
        let model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        let ranked = SimilarityRetriever::new(&model)
            .rank("nothing in common", &ids(&["c", "a", "b"]), 3)
            .unwrap();
        let order: Vec<&str> = ranked.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn missing_examples_are_an_error() {
        let model = VectorSpaceModel::fit(&corpus(), &VectorizerConfig::default()).unwrap();
        let retriever = SimilarityRetriever::new(&model);
        for example_ids in [vec![], ids(&["zzz"])] {
            let err = retriever.rank("bread", &example_ids, 3).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::MissingArtifact { .. })
            ));
        }
    }

    #[tokio::test]
    async fn loads_documents_in_rank_order() {
        let docs = corpus();
        let model = VectorSpaceModel::fit(&docs, &VectorizerConfig::default()).unwrap();
        let store = InMemoryStore::with_documents(docs.clone());
        store
            .save_examples(&[
                Example {
                    document_id: "a".into(),
                    cluster_id: 0,
                    distance_to_centroid: 0.0,
                },
                Example {
                    document_id: "c".into(),
                    cluster_id: 1,
                    distance_to_centroid: 0.0,
                },
            ])
            .await
            .unwrap();

        let found = find_similar_examples(&store, &model, "planets and comets", 2)
            .await
            .unwrap();
        let order: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(order, vec!["c", "a"]);
    }
}
