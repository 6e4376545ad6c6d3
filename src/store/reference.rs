//! Named references.
//!
//! A reference is an entry of the top-level index carrying the
//! `org.opencontainers.image.ref.name` annotation. These helpers translate
//! name-based operations onto [`Engine::get_index`] and [`Engine::put_index`].
use super::Engine;
use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    image::{ANNOTATION_REF_NAME, Descriptor},
};

/// Checks that `name` is usable as a reference name.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-._:@/+".contains(c));
    if !valid {
        return Err(Error::Invalid(format!("invalid reference name '{name}'")));
    }
    Ok(())
}

fn named(descriptor: &Descriptor, name: &str) -> Descriptor {
    let mut descriptor = descriptor.clone();
    descriptor
        .annotations
        .insert(ANNOTATION_REF_NAME.to_owned(), name.to_owned());
    descriptor
}

fn unnamed(descriptor: &Descriptor) -> Descriptor {
    let mut descriptor = descriptor.clone();
    descriptor.annotations.remove(ANNOTATION_REF_NAME);
    descriptor
}

pub trait References: Engine {
    /// Binds `name` to `descriptor`.
    ///
    /// Rebinding a name to the descriptor it already points at succeeds;
    /// rebinding it to anything else fails with [`Error::Clobber`].
    #[tracing::instrument(level = "debug", skip(self, ctx, descriptor), fields(digest = %descriptor.digest))]
    fn put_reference(&self, ctx: &CancelToken, name: &str, descriptor: &Descriptor) -> Result<()> {
        validate_name(name)?;
        let mut index = self.get_index(ctx)?;

        let existing: Vec<&Descriptor> = index
            .manifests
            .iter()
            .filter(|d| d.ref_name() == Some(name))
            .collect();
        if !existing.is_empty() {
            if existing.iter().all(|d| d.same_target(descriptor)) {
                tracing::debug!("Reference already points at descriptor");
                return Ok(());
            }
            return Err(Error::Clobber(format!(
                "reference '{name}' already points elsewhere"
            )));
        }

        index.manifests.push(named(descriptor, name));
        self.put_index(ctx, &index)
    }

    /// Binds `name` to `descriptor`, replacing whatever it pointed at.
    #[tracing::instrument(level = "debug", skip(self, ctx, descriptor), fields(digest = %descriptor.digest))]
    fn update_reference(
        &self,
        ctx: &CancelToken,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<()> {
        validate_name(name)?;
        let mut index = self.get_index(ctx)?;
        index.manifests.retain(|d| d.ref_name() != Some(name));
        index.manifests.push(named(descriptor, name));
        self.put_index(ctx, &index)
    }

    /// The descriptor `name` points at, without the name annotation.
    fn get_reference(&self, ctx: &CancelToken, name: &str) -> Result<Descriptor> {
        self.get_index(ctx)?
            .manifests
            .iter()
            .find(|d| d.ref_name() == Some(name))
            .map(unnamed)
            .ok_or_else(|| Error::NotFound(format!("reference '{name}'")))
    }

    /// Removes every binding of `name`. Removing an unknown name succeeds.
    fn delete_reference(&self, ctx: &CancelToken, name: &str) -> Result<()> {
        let mut index = self.get_index(ctx)?;
        let before = index.manifests.len();
        index.manifests.retain(|d| d.ref_name() != Some(name));
        if index.manifests.len() == before {
            return Ok(());
        }
        tracing::debug!(name, "Deleted reference");
        self.put_index(ctx, &index)
    }

    /// All reference names, sorted and deduplicated.
    fn list_references(&self, ctx: &CancelToken) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .get_index(ctx)?
            .manifests
            .iter()
            .filter_map(Descriptor::ref_name)
            .map(str::to_owned)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

impl<E: Engine + ?Sized> References for E {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("latest").is_ok());
        assert!(validate_name("v1.2.3-rc1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("new\nline").is_err());
    }
}
