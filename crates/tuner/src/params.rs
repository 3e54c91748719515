use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One axis of the parameter grid: either a fixed scalar or a list of
/// alternatives to sweep over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValues {
    Many(Vec<Value>),
    One(Value),
}

impl ParamValues {
    /// View the axis as a slice of alternatives. A fixed scalar is an axis
    /// of cardinality one.
    pub fn alternatives(&self) -> &[Value] {
        match self {
            ParamValues::Many(values) => values,
            ParamValues::One(value) => std::slice::from_ref(value),
        }
    }
}

/// One concrete choice of value for every configured parameter path,
/// e.g. `{"encoder.bitrate": 2000, "encoder.gop": 50}`.
pub type ParameterAssignment = IndexMap<String, Value>;

/// Expand parameter definitions into the full Cartesian product.
///
/// Assignments come out in the deterministic grid order: keys keep their
/// declaration order and the last key varies fastest. An empty definition
/// map yields exactly one empty assignment ("run the template unmodified").
/// Any key with an empty alternative list empties the whole product, which
/// callers treat as "nothing to run".
pub fn expand(defs: &IndexMap<String, ParamValues>) -> Vec<ParameterAssignment> {
    let axes: Vec<(&String, &[Value])> = defs
        .iter()
        .map(|(key, values)| (key, values.alternatives()))
        .collect();

    if axes.iter().any(|(_, alts)| alts.is_empty()) {
        return Vec::new();
    }

    let total: usize = axes.iter().map(|(_, alts)| alts.len()).product();

    // Strides for mixed-radix decomposition, last axis fastest.
    let mut strides = vec![1usize; axes.len()];
    for i in (0..axes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * axes[i + 1].1.len();
    }

    let mut assignments = Vec::with_capacity(total);
    for n in 0..total {
        let mut assignment = ParameterAssignment::with_capacity(axes.len());
        for (i, (key, alts)) in axes.iter().enumerate() {
            let index = (n / strides[i]) % alts.len();
            assignment.insert((*key).clone(), alts[index].clone());
        }
        assignments.push(assignment);
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn defs(entries: &[(&str, ParamValues)]) -> IndexMap<String, ParamValues> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_definitions_yield_single_empty_assignment() {
        let assignments = expand(&IndexMap::new());
        assert_eq!(assignments.len(), 1);
        assert!(assignments[0].is_empty());
    }

    #[test]
    fn empty_alternative_list_empties_the_product() {
        let d = defs(&[
            ("encoder.bitrate", ParamValues::Many(vec![json!(2000), json!(3000)])),
            ("encoder.gop", ParamValues::Many(vec![])),
        ]);
        assert!(expand(&d).is_empty());
    }

    #[test]
    fn single_scalar_counts_as_one_alternative() {
        let d = defs(&[
            ("encoder.bitrate", ParamValues::One(json!(2000))),
            ("encoder.preset", ParamValues::Many(vec![json!("fast"), json!("slow")])),
        ]);
        let assignments = expand(&d);
        assert_eq!(assignments.len(), 2);
        for a in &assignments {
            assert_eq!(a["encoder.bitrate"], json!(2000));
        }
    }

    #[test]
    fn last_key_varies_fastest() {
        let d = defs(&[
            ("a", ParamValues::Many(vec![json!(1), json!(2)])),
            ("b", ParamValues::Many(vec![json!("x"), json!("y")])),
        ]);
        let assignments = expand(&d);
        let flat: Vec<(i64, String)> = assignments
            .iter()
            .map(|a| {
                (
                    a["a"].as_i64().unwrap(),
                    a["b"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            flat,
            vec![
                (1, "x".to_string()),
                (1, "y".to_string()),
                (2, "x".to_string()),
                (2, "y".to_string()),
            ]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The product has exactly C1 x ... x Cn assignments, each complete
        /// over every key, with no duplicates.
        #[test]
        fn product_cardinality_and_uniqueness(
            cardinalities in proptest::collection::vec(1usize..4, 1..4),
        ) {
            let d: IndexMap<String, ParamValues> = cardinalities
                .iter()
                .enumerate()
                .map(|(i, &c)| {
                    let alts: Vec<Value> = (0..c).map(|v| json!(v)).collect();
                    (format!("k{}", i), ParamValues::Many(alts))
                })
                .collect();

            let assignments = expand(&d);
            let expected: usize = cardinalities.iter().product();
            prop_assert_eq!(assignments.len(), expected);

            let mut seen = HashSet::new();
            for a in &assignments {
                prop_assert_eq!(a.len(), d.len());
                for key in d.keys() {
                    prop_assert!(a.contains_key(key));
                }
                let fingerprint = serde_json::to_string(a).unwrap();
                prop_assert!(seen.insert(fingerprint), "duplicate assignment");
            }
        }
    }
}
