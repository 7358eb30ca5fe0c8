//! Finite-element model with selection state.
//!
//! Holds nodes, elements and element types, the active attribute pointers
//! used by `E`, the current node and element selections and named
//! components. Also produces the flat arrays served by the mesh queries.

use crate::error::SimError;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Key options per element type.
pub const KEYOPT_COUNT: usize = 18;

/// Fixed fields in front of each element's node list.
pub const ELEM_HEADER_LEN: usize = 10;

/// Which entity a selection or component applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Node,
    Elem,
}

impl Entity {
    pub fn parse(s: &str) -> Result<Self, SimError> {
        match s.to_ascii_uppercase().as_str() {
            "NODE" => Ok(Entity::Node),
            "ELEM" => Ok(Entity::Elem),
            other => Err(SimError::invalid(format!("unknown entity {}", other))),
        }
    }
}

/// Selection operation of `NSEL`, `ESEL`, `NSLE` and `CMSEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Select a new set.
    Select,
    /// Reselect from the current set.
    Reselect,
    /// Add to the current set.
    Also,
    /// Remove from the current set.
    Unselect,
    All,
    None,
    Invert,
}

impl SelectMode {
    pub fn parse(s: &str) -> Result<Self, SimError> {
        match s.to_ascii_uppercase().as_str() {
            "S" | "" => Ok(SelectMode::Select),
            "R" => Ok(SelectMode::Reselect),
            "A" => Ok(SelectMode::Also),
            "U" => Ok(SelectMode::Unselect),
            "ALL" => Ok(SelectMode::All),
            "NONE" => Ok(SelectMode::None),
            "INVE" => Ok(SelectMode::Invert),
            other => Err(SimError::invalid(format!("unknown selection type {}", other))),
        }
    }

    /// Applies this operation with `picked` as the operand set.
    fn apply(self, current: &mut BTreeSet<i32>, picked: BTreeSet<i32>, universe: &BTreeSet<i32>) {
        match self {
            SelectMode::Select => *current = picked,
            SelectMode::Reselect => current.retain(|n| picked.contains(n)),
            SelectMode::Also => current.extend(picked),
            SelectMode::Unselect => current.retain(|n| !picked.contains(n)),
            SelectMode::All => *current = universe.clone(),
            SelectMode::None => current.clear(),
            SelectMode::Invert => {
                *current = universe.difference(current).copied().collect();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub material: i32,
    pub etype: i32,
    pub real: i32,
    pub section: i32,
    pub esys: i32,
    pub shape: i32,
    pub nodes: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementTypeDef {
    pub routine: i32,
    pub keyopts: [i32; KEYOPT_COUNT],
}

#[derive(Debug, Clone, Copy)]
struct Attributes {
    etype: i32,
    material: i32,
    real: i32,
    section: i32,
    esys: i32,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            etype: 1,
            material: 1,
            real: 1,
            section: 1,
            esys: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Component {
    entity: Entity,
    items: BTreeSet<i32>,
}

/// The model database.
#[derive(Debug, Default)]
pub struct Model {
    nodes: BTreeMap<i32, [f64; 3]>,
    elements: BTreeMap<i32, Element>,
    element_types: BTreeMap<i32, ElementTypeDef>,
    attributes: Attributes,
    selected_nodes: BTreeSet<i32>,
    selected_elements: BTreeSet<i32>,
    components: HashMap<String, Component>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the whole model.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    // ------------------------------------------------------------------
    // Definition
    // ------------------------------------------------------------------

    /// `ET,itype,ename`. The routine number is the trailing digits of
    /// `ename`, so `LINK180` and `180` are equivalent.
    pub fn define_element_type(&mut self, itype: i32, ename: &str) -> Result<(), SimError> {
        let digits: String = ename
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let routine: i32 = digits
            .parse()
            .map_err(|_| SimError::invalid(format!("unknown element name {}", ename)))?;
        if itype <= 0 {
            return Err(SimError::invalid("element type number must be positive"));
        }
        self.element_types.insert(
            itype,
            ElementTypeDef {
                routine,
                keyopts: [0; KEYOPT_COUNT],
            },
        );
        Ok(())
    }

    /// `KEYOPT,itype,knum,value`.
    pub fn set_keyopt(&mut self, itype: i32, knum: usize, value: i32) -> Result<(), SimError> {
        let def = self
            .element_types
            .get_mut(&itype)
            .ok_or_else(|| SimError::NotFound(format!("element type {}", itype)))?;
        if !(1..=KEYOPT_COUNT).contains(&knum) {
            return Err(SimError::invalid(format!("key option {} out of range", knum)));
        }
        def.keyopts[knum - 1] = value;
        Ok(())
    }

    pub fn set_type(&mut self, n: i32) {
        self.attributes.etype = n;
    }

    pub fn set_material(&mut self, n: i32) {
        self.attributes.material = n;
    }

    pub fn set_real(&mut self, n: i32) {
        self.attributes.real = n;
    }

    pub fn set_section(&mut self, n: i32) {
        self.attributes.section = n;
    }

    pub fn set_esys(&mut self, n: i32) {
        self.attributes.esys = n;
    }

    /// `N,num,x,y,z`. A missing number takes the next free one. New nodes
    /// are selected.
    pub fn add_node(&mut self, num: Option<i32>, xyz: [f64; 3]) -> Result<i32, SimError> {
        let num = match num {
            Some(n) if n > 0 => n,
            Some(n) => return Err(SimError::invalid(format!("node number {}", n))),
            None => self.nodes.keys().next_back().map_or(1, |n| n + 1),
        };
        self.nodes.insert(num, xyz);
        self.selected_nodes.insert(num);
        Ok(num)
    }

    /// `E,i,j,...` with the active attributes. New elements are selected.
    pub fn add_element(&mut self, nodes: Vec<i32>) -> Result<i32, SimError> {
        if nodes.is_empty() {
            return Err(SimError::invalid("element needs at least one node"));
        }
        if let Some(missing) = nodes.iter().find(|n| !self.nodes.contains_key(n)) {
            return Err(SimError::NotFound(format!("node {}", missing)));
        }
        let attrs = self.attributes;
        if !self.element_types.contains_key(&attrs.etype) {
            return Err(SimError::NotFound(format!("element type {}", attrs.etype)));
        }
        let num = self.elements.keys().next_back().map_or(1, |n| n + 1);
        self.elements.insert(
            num,
            Element {
                material: attrs.material,
                etype: attrs.etype,
                real: attrs.real,
                section: attrs.section,
                esys: attrs.esys,
                shape: 0,
                nodes,
            },
        );
        self.selected_elements.insert(num);
        Ok(num)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// `NSEL,type,NODE,,min,max`.
    pub fn select_nodes(
        &mut self,
        mode: SelectMode,
        range: Option<(i32, i32)>,
    ) -> Result<usize, SimError> {
        let universe: BTreeSet<i32> = self.nodes.keys().copied().collect();
        let picked = pick_range(&universe, mode, range)?;
        mode.apply(&mut self.selected_nodes, picked, &universe);
        Ok(self.selected_nodes.len())
    }

    /// `ESEL,type,item,,min,max` with item `ELEM`, `TYPE` or `MAT`.
    pub fn select_elements(
        &mut self,
        mode: SelectMode,
        item: &str,
        range: Option<(i32, i32)>,
    ) -> Result<usize, SimError> {
        let universe: BTreeSet<i32> = self.elements.keys().copied().collect();
        let picked = match item.to_ascii_uppercase().as_str() {
            "" | "ELEM" => pick_range(&universe, mode, range)?,
            item @ ("TYPE" | "MAT") => {
                let (lo, hi) = range.ok_or_else(|| {
                    SimError::invalid(format!("ESEL by {} needs a value", item))
                })?;
                self.elements
                    .iter()
                    .filter(|(_, e)| {
                        let v = if item == "TYPE" { e.etype } else { e.material };
                        (lo..=hi).contains(&v)
                    })
                    .map(|(&n, _)| n)
                    .collect()
            }
            other => return Err(SimError::invalid(format!("unknown ESEL item {}", other))),
        };
        mode.apply(&mut self.selected_elements, picked, &universe);
        Ok(self.selected_elements.len())
    }

    /// `NSLE,type`: nodes attached to the selected elements.
    pub fn select_nodes_of_elements(&mut self, mode: SelectMode) -> usize {
        let universe: BTreeSet<i32> = self.nodes.keys().copied().collect();
        let attached: BTreeSet<i32> = self
            .selected_elements
            .iter()
            .filter_map(|n| self.elements.get(n))
            .flat_map(|e| e.nodes.iter().copied())
            .collect();
        mode.apply(&mut self.selected_nodes, attached, &universe);
        self.selected_nodes.len()
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    /// `CM,name,entity`: stores the current selection.
    pub fn create_component(&mut self, name: &str, entity: Entity) {
        let items = match entity {
            Entity::Node => self.selected_nodes.clone(),
            Entity::Elem => self.selected_elements.clone(),
        };
        self.components
            .insert(name.to_ascii_uppercase(), Component { entity, items });
    }

    /// `CMSEL,type,name[,entity]`.
    pub fn select_component(
        &mut self,
        mode: SelectMode,
        name: &str,
        entity: Option<Entity>,
    ) -> Result<(), SimError> {
        if matches!(mode, SelectMode::All | SelectMode::None) {
            let nodes: BTreeSet<i32> = self.nodes.keys().copied().collect();
            let elements: BTreeSet<i32> = self.elements.keys().copied().collect();
            mode.apply(&mut self.selected_nodes, BTreeSet::new(), &nodes);
            mode.apply(&mut self.selected_elements, BTreeSet::new(), &elements);
            return Ok(());
        }
        let component = self
            .components
            .get(&name.to_ascii_uppercase())
            .ok_or_else(|| SimError::NotFound(format!("component {}", name)))?;
        if let Some(entity) = entity {
            if entity != component.entity {
                return Err(SimError::invalid(format!(
                    "component {} holds {:?}, not {:?}",
                    name, component.entity, entity
                )));
            }
        }
        let items = component.items.clone();
        match component.entity {
            Entity::Node => {
                let universe = self.nodes.keys().copied().collect();
                let live = items.into_iter().filter(|n| self.nodes.contains_key(n)).collect();
                mode.apply(&mut self.selected_nodes, live, &universe);
            }
            Entity::Elem => {
                let universe = self.elements.keys().copied().collect();
                let live = items
                    .into_iter()
                    .filter(|n| self.elements.contains_key(n))
                    .collect();
                mode.apply(&mut self.selected_elements, live, &universe);
            }
        }
        Ok(())
    }

    /// `CMDELE,name`.
    pub fn delete_component(&mut self, name: &str) -> Result<(), SimError> {
        self.components
            .remove(&name.to_ascii_uppercase())
            .map(|_| ())
            .ok_or_else(|| SimError::NotFound(format!("component {}", name)))
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.components.contains_key(&name.to_ascii_uppercase())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn node_count(&self) -> usize {
        self.selected_nodes.len()
    }

    pub fn element_count(&self) -> usize {
        self.selected_elements.len()
    }

    pub fn max_node(&self) -> i32 {
        self.nodes.keys().next_back().copied().unwrap_or(0)
    }

    pub fn max_element(&self) -> i32 {
        self.elements.keys().next_back().copied().unwrap_or(0)
    }

    pub fn node_location(&self, num: i32) -> Option<[f64; 3]> {
        self.nodes.get(&num).copied()
    }

    pub fn selected_nodes(&self) -> impl Iterator<Item = i32> + '_ {
        self.selected_nodes.iter().copied()
    }

    pub fn selected_elements(&self) -> impl Iterator<Item = i32> + '_ {
        self.selected_elements.iter().copied()
    }

    /// Coordinates of the selected nodes, flattened N×3.
    pub fn coordinates(&self) -> Vec<f64> {
        self.selected_nodes
            .iter()
            .filter_map(|n| self.nodes.get(n))
            .flat_map(|xyz| xyz.iter().copied())
            .collect()
    }

    /// Connectivity of the selected elements: a slot table of record
    /// starts followed by the records. Empty when nothing is selected.
    pub fn element_blob(&self) -> Vec<i32> {
        let selected: Vec<(i32, &Element)> = self
            .selected_elements
            .iter()
            .filter_map(|n| self.elements.get(n).map(|e| (*n, e)))
            .collect();
        if selected.is_empty() {
            return Vec::new();
        }

        let n = selected.len();
        let mut slots = Vec::with_capacity(n);
        let mut records = Vec::new();
        for (num, e) in &selected {
            slots.push((n + records.len()) as i32);
            records.extend([
                e.material, e.etype, e.real, e.section, e.esys, 0, 0, e.shape, *num, 0,
            ]);
            records.extend(&e.nodes);
        }
        slots.extend(records);
        slots
    }

    /// Element type table: slot count, record starts, then
    /// `[type, routine, keyopt 1..18]` per defined type.
    pub fn element_type_table(&self) -> Vec<i32> {
        let n = self.element_types.len();
        let record_len = 2 + KEYOPT_COUNT;
        let mut data = Vec::with_capacity(1 + n + n * record_len);
        data.push(n as i32);
        data.extend((0..n).map(|i| (1 + n + i * record_len) as i32));
        for (itype, def) in &self.element_types {
            data.push(*itype);
            data.push(def.routine);
            data.extend(def.keyopts);
        }
        data
    }
}

fn pick_range(
    universe: &BTreeSet<i32>,
    mode: SelectMode,
    range: Option<(i32, i32)>,
) -> Result<BTreeSet<i32>, SimError> {
    match (mode, range) {
        (SelectMode::All | SelectMode::None | SelectMode::Invert, _) => Ok(BTreeSet::new()),
        (_, Some((lo, hi))) => Ok(universe.range(lo..=hi.max(lo)).copied().collect()),
        (_, None) => Err(SimError::invalid("selection needs a range")),
    }
}
