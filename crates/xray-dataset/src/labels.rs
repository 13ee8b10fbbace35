//! Multi-hot label encoding.

use xray_core::{DISEASES, NO_FINDING, NUM_DISEASES};

/// Ordered finding names defining the label-vector axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiseaseVocabulary {
    names: Vec<String>,
}

impl Default for DiseaseVocabulary {
    fn default() -> Self {
        Self::standard()
    }
}

impl DiseaseVocabulary {
    /// The 14 findings in their fixed order
    pub fn standard() -> Self {
        Self {
            names: DISEASES.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Encode a pipe-delimited finding string.
    ///
    /// The zero vector iff every token is `No Finding`; otherwise position `i`
    /// is 1.0 iff finding `i` is one of the tokens. Unrecognized tokens are
    /// ignored.
    pub fn encode(&self, findings: &str) -> Vec<f32> {
        let tokens: Vec<&str> = findings.split('|').collect();
        if tokens.iter().all(|&t| t == NO_FINDING) {
            return vec![0.0; self.names.len()];
        }
        self.names
            .iter()
            .map(|name| {
                if tokens.iter().any(|&t| t == name) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Tokens that are neither a vocabulary finding nor the sentinel
    pub fn unrecognized<'a>(&self, findings: &'a str) -> Vec<&'a str> {
        findings
            .split('|')
            .filter(|&t| t != NO_FINDING && self.index_of(t).is_none())
            .collect()
    }
}

/// Encode against the standard vocabulary
pub fn encode(findings: &str) -> [f32; NUM_DISEASES] {
    let mut out = [0.0f32; NUM_DISEASES];
    for (slot, value) in out
        .iter_mut()
        .zip(DiseaseVocabulary::standard().encode(findings))
    {
        *slot = value;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_finding_is_zero_vector() {
        assert_eq!(encode("No Finding"), [0.0; NUM_DISEASES]);
        assert_eq!(encode("No Finding|No Finding"), [0.0; NUM_DISEASES]);
    }

    #[test]
    fn test_single_token_is_one_hot() {
        for (i, disease) in DISEASES.iter().enumerate() {
            let v = encode(disease);
            assert_eq!(v.iter().filter(|&&x| x == 1.0).count(), 1);
            assert_eq!(v[i], 1.0);
        }
    }

    #[test]
    fn test_multi_label() {
        let v = encode("Effusion|Pneumonia|Atelectasis");
        assert_eq!(v[0], 1.0);
        assert_eq!(v[4], 1.0);
        assert_eq!(v[12], 1.0);
        assert_eq!(v.iter().sum::<f32>(), 3.0);
    }

    #[test]
    fn test_unrecognized_tokens_ignored() {
        let vocab = DiseaseVocabulary::standard();
        assert_eq!(encode("Flu"), [0.0; NUM_DISEASES]);
        assert_eq!(encode("Flu|Mass")[9], 1.0);
        assert_eq!(vocab.unrecognized("Flu|Mass|No Finding"), vec!["Flu"]);
        assert_eq!(vocab.len(), NUM_DISEASES);
        assert_eq!(vocab.index_of("Hernia"), Some(7));
    }
}
