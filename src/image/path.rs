use super::Descriptor;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// The chain of descriptors leading from an index entry to a target blob.
///
/// The first element is the entry in the store's top-level index, the last is
/// the descriptor actually being addressed. Intermediate elements are nested
/// indexes walked on the way down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Walk", into = "Walk")]
pub struct DescriptorPath {
    walk: Vec<Descriptor>,
}

#[derive(Serialize, Deserialize)]
struct Walk {
    walk: Vec<Descriptor>,
}

impl DescriptorPath {
    pub fn new(root: Descriptor) -> Self {
        Self { walk: vec![root] }
    }

    /// Builds a path from an explicit chain, which must not be empty.
    pub fn from_walk(walk: Vec<Descriptor>) -> Result<Self> {
        if walk.is_empty() {
            return Err(Error::Invalid("empty descriptor path".to_owned()));
        }
        Ok(Self { walk })
    }

    /// The top-level index entry this path starts from.
    pub fn root(&self) -> &Descriptor {
        &self.walk[0]
    }

    /// The descriptor this path addresses.
    pub fn descriptor(&self) -> &Descriptor {
        &self.walk[self.walk.len() - 1]
    }

    pub fn walk(&self) -> &[Descriptor] {
        &self.walk
    }

    /// A new path one step deeper.
    pub fn child(&self, descriptor: Descriptor) -> Self {
        let mut walk = self.walk.clone();
        walk.push(descriptor);
        Self { walk }
    }
}

impl TryFrom<Walk> for DescriptorPath {
    type Error = Error;

    fn try_from(value: Walk) -> Result<Self> {
        Self::from_walk(value.walk)
    }
}

impl From<DescriptorPath> for Walk {
    fn from(value: DescriptorPath) -> Self {
        Self { walk: value.walk }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestAlgorithm;
    use crate::image::{MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST};

    #[test]
    fn test_root_and_descriptor() {
        let index = Descriptor::new(
            MEDIA_TYPE_IMAGE_INDEX,
            DigestAlgorithm::Sha256.digest_bytes(b"index"),
            5,
        );
        let manifest = Descriptor::new(
            MEDIA_TYPE_IMAGE_MANIFEST,
            DigestAlgorithm::Sha256.digest_bytes(b"manifest"),
            8,
        );

        let path = DescriptorPath::new(index.clone());
        assert_eq!(path.root(), path.descriptor());

        let path = path.child(manifest.clone());
        assert_eq!(path.root(), &index);
        assert_eq!(path.descriptor(), &manifest);
        assert_eq!(path.walk().len(), 2);
    }

    #[test]
    fn test_serde_rejects_empty_walk() {
        assert!(serde_json::from_str::<DescriptorPath>(r#"{"walk":[]}"#).is_err());

        let path = DescriptorPath::new(Descriptor::new(
            MEDIA_TYPE_IMAGE_MANIFEST,
            DigestAlgorithm::Sha256.digest_bytes(b"m"),
            1,
        ));
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(serde_json::from_str::<DescriptorPath>(&json).unwrap(), path);
    }
}
