//! Validates extracted entities/relations against the active ontology. A
//! pure function, no I/O — the only gate that trusts LLM output as
//! safe-for-ontology; everything upstream treats it as adversarial.

use std::collections::HashSet;

use crate::models::{ExtractedEntity, ExtractedRelation, OntologySchema};

/// Drops entities whose type isn't in `schema.entity_types`, then drops
/// relations whose type isn't in `schema.relation_types` or whose source
/// or target was dropped in the first pass.
pub fn validate_and_filter(
    entities: Vec<ExtractedEntity>,
    relations: Vec<ExtractedRelation>,
    schema: &OntologySchema,
) -> (Vec<ExtractedEntity>, Vec<ExtractedRelation>) {
    let allowed_entity_types: HashSet<&str> = schema.entity_types.iter().map(String::as_str).collect();
    let allowed_relation_types: HashSet<&str> = schema.relation_types.iter().map(String::as_str).collect();

    let filtered_entities: Vec<ExtractedEntity> = entities
        .into_iter()
        .filter(|e| allowed_entity_types.contains(e.entity_type.as_str()))
        .collect();

    let surviving_ids: HashSet<&str> = filtered_entities.iter().map(|e| e.temp_id.as_str()).collect();

    let filtered_relations: Vec<ExtractedRelation> = relations
        .into_iter()
        .filter(|r| {
            allowed_relation_types.contains(r.relation_type.as_str())
                && surviving_ids.contains(r.source_temp_id.as_str())
                && surviving_ids.contains(r.target_temp_id.as_str())
        })
        .collect();

    (filtered_entities, filtered_relations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> OntologySchema {
        OntologySchema {
            entity_types: vec!["Person".to_string()],
            relation_types: vec!["KNOWS".to_string()],
            source_types: Default::default(),
            target_types: Default::default(),
        }
    }

    fn entity(id: &str, entity_type: &str) -> ExtractedEntity {
        ExtractedEntity {
            temp_id: id.to_string(),
            name: id.to_string(),
            entity_type: entity_type.to_string(),
        }
    }

    fn relation(source: &str, target: &str, relation_type: &str) -> ExtractedRelation {
        ExtractedRelation {
            source_temp_id: source.to_string(),
            target_temp_id: target.to_string(),
            relation_type: relation_type.to_string(),
            chunk_id: None,
        }
    }

    #[test]
    fn drops_entities_outside_ontology() {
        let entities = vec![entity("A", "Person"), entity("B", "Weapon")];
        let (filtered, _) = validate_and_filter(entities, vec![], &schema());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].temp_id, "A");
    }

    #[test]
    fn drops_relations_outside_ontology_or_with_missing_endpoint() {
        let entities = vec![entity("A", "Person"), entity("B", "Person")];
        let relations = vec![
            relation("A", "B", "KNOWS"),
            relation("A", "B", "HATES"),
            relation("A", "GHOST", "KNOWS"),
        ];
        let (_, filtered) = validate_and_filter(entities, relations, &schema());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].relation_type, "KNOWS");
    }

    #[test]
    fn cypher_injection_payload_as_entity_type_is_dropped() {
        let malicious = entity("X", "Person`]) MATCH (n) DETACH DELETE n //");
        let (filtered, _) = validate_and_filter(vec![malicious], vec![], &schema());
        assert!(filtered.is_empty());
    }
}
