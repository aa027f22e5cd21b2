// Queue families and queue roles
//
// A device exposes families of queues with a capability set each. We need
// one queue per role (graphics, compute, transfer, present); several roles
// may end up on the same family.

use ash::vk;
use bitflags::bitflags;
use std::collections::BTreeSet;

bitflags! {
    /// Capability set of a queue family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueProperties: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const PRESENT = 1 << 3;
    }
}

/// A single role a queue can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueProperty {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueProperty {
    pub const ALL: [QueueProperty; 4] = [
        QueueProperty::Graphics,
        QueueProperty::Compute,
        QueueProperty::Transfer,
        QueueProperty::Present,
    ];

    pub fn flag(self) -> QueueProperties {
        match self {
            QueueProperty::Graphics => QueueProperties::GRAPHICS,
            QueueProperty::Compute => QueueProperties::COMPUTE,
            QueueProperty::Transfer => QueueProperties::TRANSFER,
            QueueProperty::Present => QueueProperties::PRESENT,
        }
    }
}

/// One hardware queue family as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    index: u32,
    queue_count: u32,
    timestamp_valid_bits: u32,
    properties: QueueProperties,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        queue_count: u32,
        timestamp_valid_bits: u32,
        properties: QueueProperties,
    ) -> Self {
        Self {
            index,
            queue_count,
            timestamp_valid_bits,
            properties,
        }
    }

    /// Builds a family from driver data.
    ///
    /// Graphics and compute families can always do transfers even when the
    /// driver leaves the TRANSFER bit out, so it is added here.
    pub fn from_vk(index: u32, props: &vk::QueueFamilyProperties, can_present: bool) -> Self {
        let mut properties = QueueProperties::empty();
        if props.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            properties |= QueueProperties::GRAPHICS | QueueProperties::TRANSFER;
        }
        if props.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            properties |= QueueProperties::COMPUTE | QueueProperties::TRANSFER;
        }
        if props.queue_flags.contains(vk::QueueFlags::TRANSFER) {
            properties |= QueueProperties::TRANSFER;
        }
        if can_present {
            properties |= QueueProperties::PRESENT;
        }

        Self::new(index, props.queue_count, props.timestamp_valid_bits, properties)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn queue_count(&self) -> u32 {
        self.queue_count
    }

    pub fn timestamp_valid_bits(&self) -> u32 {
        self.timestamp_valid_bits
    }

    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    pub fn has(&self, property: QueueProperty) -> bool {
        self.properties.contains(property.flag())
    }

    /// True when the family serves exactly one role.
    pub fn is_exclusive(&self) -> bool {
        self.properties.bits().count_ones() == 1
    }
}

/// All queue families of one physical device.
#[derive(Debug, Clone, Default)]
pub struct QueueFamilyContainer {
    families: Vec<QueueFamily>,
    covered: QueueProperties,
}

impl QueueFamilyContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_family(&mut self, family: QueueFamily) {
        self.covered |= family.properties;
        self.families.push(family);
    }

    pub fn families(&self) -> &[QueueFamily] {
        &self.families
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn family(&self, index: u32) -> Option<&QueueFamily> {
        self.families.iter().find(|f| f.index == index)
    }

    pub fn families_with(&self, property: QueueProperty) -> impl Iterator<Item = &QueueFamily> {
        self.families.iter().filter(move |f| f.has(property))
    }

    /// Every role is served by at least one family.
    pub fn has_all_properties(&self) -> bool {
        self.covered.contains(QueueProperties::all())
    }

    /// Picks one family per role, or `None` if some role has no family.
    pub fn select(&self) -> Option<QueueSelection> {
        Some(QueueSelection {
            graphics: self.best_family(QueueProperty::Graphics)?,
            compute: self.best_family(QueueProperty::Compute)?,
            transfer: self.best_family(QueueProperty::Transfer)?,
            present: self.best_family(QueueProperty::Present)?,
        })
    }

    fn best_family(&self, property: QueueProperty) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for family in &self.families {
            if let Some(score) = role_score(property, family) {
                if best.map_or(true, |(best_score, _)| score > best_score) {
                    best = Some((score, family.index));
                }
            }
        }
        best.map(|(_, index)| index)
    }
}

// Graphics and present like all-rounder families so both roles share one
// queue. Compute and transfer like families that do little else so they
// land on separate hardware engines.
fn role_score(property: QueueProperty, family: &QueueFamily) -> Option<u32> {
    if !family.has(property) {
        return None;
    }

    let has = |p: QueueProperty| u32::from(family.has(p));
    let lacks = |p: QueueProperty| u32::from(!family.has(p));

    let score = match property {
        QueueProperty::Graphics => {
            5 * has(QueueProperty::Present) + has(QueueProperty::Compute) + has(QueueProperty::Transfer)
        }
        QueueProperty::Present => {
            5 * has(QueueProperty::Graphics) + 4 * has(QueueProperty::Compute) + has(QueueProperty::Transfer)
        }
        QueueProperty::Compute => {
            lacks(QueueProperty::Graphics) + lacks(QueueProperty::Transfer) + lacks(QueueProperty::Present)
        }
        QueueProperty::Transfer => {
            lacks(QueueProperty::Graphics) + lacks(QueueProperty::Compute) + lacks(QueueProperty::Present)
        }
    };
    Some(score)
}

/// Family index chosen for each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSelection {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    pub present: u32,
}

impl QueueSelection {
    pub fn family_for(&self, property: QueueProperty) -> u32 {
        match property {
            QueueProperty::Graphics => self.graphics,
            QueueProperty::Compute => self.compute,
            QueueProperty::Transfer => self.transfer,
            QueueProperty::Present => self.present,
        }
    }

    /// Distinct family indices, in ascending order. Device creation asks for
    /// one queue from each of these and nothing else.
    pub fn unique_family_indices(&self) -> BTreeSet<u32> {
        QueueProperty::ALL
            .iter()
            .map(|&p| self.family_for(p))
            .collect()
    }
}

/// A device queue together with the family it came from.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub handle: vk::Queue,
    pub family: QueueFamily,
}

/// One queue per role. Roles sharing a family share the handle.
#[derive(Debug, Clone, Copy)]
pub struct QueueContainer {
    graphics: Queue,
    compute: Queue,
    transfer: Queue,
    present: Queue,
}

impl QueueContainer {
    pub fn new(graphics: Queue, compute: Queue, transfer: Queue, present: Queue) -> Self {
        Self {
            graphics,
            compute,
            transfer,
            present,
        }
    }

    pub fn get(&self, property: QueueProperty) -> &Queue {
        match property {
            QueueProperty::Graphics => &self.graphics,
            QueueProperty::Compute => &self.compute,
            QueueProperty::Transfer => &self.transfer,
            QueueProperty::Present => &self.present,
        }
    }

    pub fn graphics(&self) -> &Queue {
        &self.graphics
    }

    pub fn present(&self) -> &Queue {
        &self.present
    }

    pub fn by_family(&self, family_index: u32) -> Option<&Queue> {
        QueueProperty::ALL
            .iter()
            .map(|&p| self.get(p))
            .find(|q| q.family.index() == family_index)
    }

    pub fn family_indices_in_use(&self) -> BTreeSet<u32> {
        QueueProperty::ALL
            .iter()
            .map(|&p| self.get(p).family.index())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, properties: QueueProperties) -> QueueFamily {
        QueueFamily::new(index, 1, 64, properties)
    }

    #[test]
    fn graphics_compute_transfer_plus_present_only_gives_two_families() {
        let mut container = QueueFamilyContainer::new();
        container.add_family(family(
            0,
            QueueProperties::GRAPHICS | QueueProperties::COMPUTE | QueueProperties::TRANSFER,
        ));
        container.add_family(family(1, QueueProperties::PRESENT));

        assert!(container.has_all_properties());
        let selection = container.select().unwrap();
        assert_eq!(selection.graphics, 0);
        assert_eq!(selection.compute, 0);
        assert_eq!(selection.transfer, 0);
        assert_eq!(selection.present, 1);

        let unique: Vec<u32> = selection.unique_family_indices().into_iter().collect();
        assert_eq!(unique, vec![0, 1]);
    }

    #[test]
    fn compute_and_transfer_prefer_dedicated_families() {
        let mut container = QueueFamilyContainer::new();
        container.add_family(family(0, QueueProperties::all()));
        container.add_family(family(1, QueueProperties::COMPUTE | QueueProperties::TRANSFER));
        container.add_family(family(2, QueueProperties::TRANSFER));

        let selection = container.select().unwrap();
        assert_eq!(selection.graphics, 0);
        assert_eq!(selection.present, 0);
        assert_eq!(selection.compute, 1);
        assert_eq!(selection.transfer, 2);
        assert_eq!(selection.unique_family_indices().len(), 3);
    }

    #[test]
    fn single_universal_family_serves_every_role() {
        let mut container = QueueFamilyContainer::new();
        container.add_family(family(0, QueueProperties::all()));
        container.add_family(family(1, QueueProperties::all()));

        let selection = container.select().unwrap();
        for property in QueueProperty::ALL {
            assert_eq!(selection.family_for(property), 0);
        }
        assert_eq!(selection.unique_family_indices().len(), 1);
    }

    #[test]
    fn missing_present_fails_selection() {
        let mut container = QueueFamilyContainer::new();
        container.add_family(family(
            0,
            QueueProperties::GRAPHICS | QueueProperties::COMPUTE | QueueProperties::TRANSFER,
        ));

        assert!(!container.has_all_properties());
        assert!(container.select().is_none());
        assert_eq!(container.families_with(QueueProperty::Present).count(), 0);
    }

    #[test]
    fn exclusivity_means_one_capability() {
        assert!(family(0, QueueProperties::TRANSFER).is_exclusive());
        assert!(!family(0, QueueProperties::COMPUTE | QueueProperties::TRANSFER).is_exclusive());
    }

    #[test]
    fn graphics_families_imply_transfer() {
        let props = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS,
            queue_count: 4,
            timestamp_valid_bits: 36,
            ..Default::default()
        };
        let family = QueueFamily::from_vk(3, &props, false);

        assert_eq!(family.index(), 3);
        assert_eq!(family.queue_count(), 4);
        assert_eq!(family.timestamp_valid_bits(), 36);
        assert!(family.has(QueueProperty::Transfer));
        assert!(!family.has(QueueProperty::Present));
    }

    #[test]
    fn queue_container_lookups() {
        let shared = family(0, QueueProperties::all() - QueueProperties::PRESENT);
        let present = family(1, QueueProperties::PRESENT);
        let queue = |family| Queue {
            handle: vk::Queue::null(),
            family,
        };
        let container = QueueContainer::new(queue(shared), queue(shared), queue(shared), queue(present));

        assert_eq!(container.by_family(1).unwrap().family.index(), 1);
        assert!(container.by_family(2).is_none());
        assert_eq!(
            container.family_indices_in_use().into_iter().collect::<Vec<_>>(),
            vec![0, 1]
        );
    }
}
