//! Local cache of the engine's finite-element mesh.
//!
//! A full populate snapshots the node selection, selects the nodes attached
//! to the selected elements, fetches node numbers, connectivity, element
//! types and coordinates on four threads, then restores the selection.
//! Every command run through the session invalidates the cache, except the
//! commands the populate itself issues.

use crate::error::ClientError;
use crate::session::{Session, WeakSession};
use femwire_protocol::Array;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const NODE_COMPONENT: &str = "__NODE__";
const ELEM_COMPONENT: &str = "__ELEM__";

/// Number of key options carried per element type.
pub const KEYOPT_COUNT: usize = 18;

/// Fixed fields leading every element record, before the node list.
pub const ELEM_HEADER_LEN: usize = 10;

const FIELD_MATERIAL: usize = 0;
const FIELD_TYPE: usize = 1;
const FIELD_REAL: usize = 2;
const FIELD_SECTION: usize = 3;
const FIELD_ESYS: usize = 4;
const FIELD_SHAPE: usize = 7;
const FIELD_ELNUM: usize = 8;

/// One element type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementType {
    /// Element type number (`ET` id).
    pub number: i32,
    /// Element routine number, e.g. 185.
    pub routine: i32,
    /// Key options 1 to 18.
    pub keyopts: [i32; KEYOPT_COUNT],
}

/// Everything one populate fetched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    nnum: Vec<i32>,
    nodes: Vec<[f64; 3]>,
    elem: Vec<i32>,
    elem_off: Vec<usize>,
    element_types: Vec<ElementType>,
}

impl MeshData {
    fn records(&self) -> impl Iterator<Item = &[i32]> + '_ {
        self.elem_off
            .windows(2)
            .map(move |w| &self.elem[w[0]..w[1]])
    }

    fn field(&self, index: usize) -> Vec<i32> {
        self.records()
            .map(|r| r.get(index).copied().unwrap_or_default())
            .collect()
    }
}

/// Holds invalidation off until dropped. Nests.
struct Suppressed<'a>(&'a AtomicUsize);

impl<'a> Suppressed<'a> {
    fn new(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::AcqRel);
        Self(depth)
    }
}

impl Drop for Suppressed<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lazily populated mesh arrays of one session.
pub struct MeshCache {
    session: WeakSession,
    data: Mutex<Option<Arc<MeshData>>>,
    populating: Mutex<()>,
    suppress: AtomicUsize,
    populates: AtomicU64,
}

impl std::fmt::Debug for MeshCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshCache")
            .field("populated", &self.is_populated())
            .field("populates", &self.populate_count())
            .finish()
    }
}

impl MeshCache {
    pub(crate) fn new(session: WeakSession) -> Self {
        Self {
            session,
            data: Mutex::new(None),
            populating: Mutex::new(()),
            suppress: AtomicUsize::new(0),
            populates: AtomicU64::new(0),
        }
    }

    pub fn is_populated(&self) -> bool {
        self.data.lock().is_some()
    }

    /// Full populates run so far.
    pub fn populate_count(&self) -> u64 {
        self.populates.load(Ordering::Acquire)
    }

    /// Drops every cached array unless a populate is in progress.
    pub fn invalidate(&self) {
        if self.suppress.load(Ordering::Acquire) > 0 {
            return;
        }
        if self.data.lock().take().is_some() {
            tracing::debug!("Mesh cache invalidated");
        }
    }

    fn session(&self) -> Result<Session, ClientError> {
        self.session.upgrade()
    }

    /// The cached mesh, populating it first when needed.
    pub fn data(&self) -> Result<Arc<MeshData>, ClientError> {
        if let Some(data) = self.data.lock().as_ref() {
            return Ok(Arc::clone(data));
        }

        let _populating = self.populating.lock();
        if let Some(data) = self.data.lock().as_ref() {
            return Ok(Arc::clone(data));
        }

        let session = self.session()?;
        let data = Arc::new(self.populate(&session)?);
        *self.data.lock() = Some(Arc::clone(&data));
        self.populates.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            "Mesh cache populated: {} nodes, {} elements, {} element types",
            data.nnum.len(),
            data.elem_off.len().saturating_sub(1),
            data.element_types.len()
        );
        Ok(data)
    }

    fn populate(&self, session: &Session) -> Result<MeshData, ClientError> {
        let _guard = Suppressed::new(&self.suppress);
        session.run(&format!("CM,{},NODE", NODE_COMPONENT))?;

        let fetched = session.run("NSLE,S").and_then(|_| fetch_all(session));

        if let Err(e) = session.run(&format!("CMSEL,S,{},NODE", NODE_COMPONENT)) {
            tracing::warn!("Failed to restore node selection: {}", e);
        }
        if let Err(e) = session.run(&format!("CMDELE,{}", NODE_COMPONENT)) {
            tracing::warn!("Failed to delete {}: {}", NODE_COMPONENT, e);
        }
        fetched
    }

    // ------------------------------------------------------------------
    // Cached accessors
    // ------------------------------------------------------------------

    /// Numbers of the selected nodes.
    pub fn nnum(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.nnum.clone())
    }

    /// Coordinates of the selected nodes.
    pub fn nodes(&self) -> Result<Vec<[f64; 3]>, ClientError> {
        Ok(self.data()?.nodes.clone())
    }

    /// Raw element records: ten header fields followed by the node list.
    pub fn elem(&self) -> Result<Vec<Vec<i32>>, ClientError> {
        Ok(self.data()?.records().map(|r| r.to_vec()).collect())
    }

    /// Start of each record in the flat connectivity array, plus its end.
    pub fn elem_off(&self) -> Result<Vec<usize>, ClientError> {
        Ok(self.data()?.elem_off.clone())
    }

    /// Element numbers taken from the records.
    pub fn elem_numbers(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.field(FIELD_ELNUM))
    }

    pub fn element_types(&self) -> Result<Vec<ElementType>, ClientError> {
        Ok(self.data()?.element_types.clone())
    }

    /// `(type number, routine number)` per element type.
    pub fn ekey(&self) -> Result<Vec<(i32, i32)>, ClientError> {
        Ok(self
            .data()?
            .element_types
            .iter()
            .map(|et| (et.number, et.routine))
            .collect())
    }

    /// Element type number of each element.
    pub fn et_id(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.field(FIELD_TYPE))
    }

    /// Element routine number of each element.
    pub fn etype(&self) -> Result<Vec<i32>, ClientError> {
        let data = self.data()?;
        let routines: BTreeMap<i32, i32> = data
            .element_types
            .iter()
            .map(|et| (et.number, et.routine))
            .collect();
        data.field(FIELD_TYPE)
            .into_iter()
            .map(|id| {
                routines.get(&id).copied().ok_or_else(|| {
                    ClientError::MalformedMesh(format!("element type {} is not defined", id))
                })
            })
            .collect()
    }

    pub fn material_type(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.field(FIELD_MATERIAL))
    }

    pub fn section(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.field(FIELD_SECTION))
    }

    pub fn elem_real_constant(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.field(FIELD_REAL))
    }

    pub fn element_coord_system(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.field(FIELD_ESYS))
    }

    /// Contact shape key of each element.
    pub fn tshape(&self) -> Result<Vec<i32>, ClientError> {
        Ok(self.data()?.field(FIELD_SHAPE))
    }

    /// Element type number to contact shape key.
    pub fn tshape_key(&self) -> Result<BTreeMap<i32, i32>, ClientError> {
        let data = self.data()?;
        Ok(data
            .field(FIELD_TYPE)
            .into_iter()
            .zip(data.field(FIELD_SHAPE))
            .collect())
    }

    /// Nonzero key options per element type as `(option number, value)`.
    pub fn key_option(&self) -> Result<BTreeMap<i32, Vec<(usize, i32)>>, ClientError> {
        let data = self.data()?;
        Ok(data
            .element_types
            .iter()
            .filter_map(|et| {
                let set: Vec<(usize, i32)> = et
                    .keyopts
                    .iter()
                    .enumerate()
                    .filter(|(_, &v)| v != 0)
                    .map(|(i, &v)| (i + 1, v))
                    .collect();
                (!set.is_empty()).then_some((et.number, set))
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Uncached queries
    // ------------------------------------------------------------------

    /// Number of selected nodes.
    pub fn n_node(&self) -> Result<u64, ClientError> {
        Ok(self.session()?.get_value("NODE", "", "COUNT", "")? as u64)
    }

    /// Number of selected elements.
    pub fn n_elem(&self) -> Result<u64, ClientError> {
        Ok(self.session()?.get_value("ELEM", "", "COUNT", "")? as u64)
    }

    /// Every node number, selected or not. The selection is left as found.
    pub fn nnum_all(&self) -> Result<Vec<i32>, ClientError> {
        self.select_all_list(NODE_COMPONENT, "NODE", "NSEL,ALL", "NLIST")
    }

    /// Every element number, selected or not. The selection is left as found.
    pub fn enum_all(&self) -> Result<Vec<i32>, ClientError> {
        self.select_all_list(ELEM_COMPONENT, "ELEM", "ESEL,ALL", "ELIST")
    }

    fn select_all_list(
        &self,
        component: &str,
        entity: &str,
        select_all: &str,
        item: &str,
    ) -> Result<Vec<i32>, ClientError> {
        let session = self.session()?;
        // shares the snapshot component with `populate`
        let _populating = self.populating.lock();
        let _guard = Suppressed::new(&self.suppress);
        session.run(&format!("CM,{},{}", component, entity))?;

        let listed = session
            .run(select_all)
            .and_then(|_| session.vget(entity, "", item, ""))
            .and_then(|array| number_list(&array));

        if let Err(e) = session.run(&format!("CMSEL,S,{},{}", component, entity)) {
            tracing::warn!("Failed to restore {} selection: {}", entity, e);
        }
        if let Err(e) = session.run(&format!("CMDELE,{}", component)) {
            tracing::warn!("Failed to delete {}: {}", component, e);
        }
        listed
    }
}

fn fetch_all(session: &Session) -> Result<MeshData, ClientError> {
    let (nnum, elements, element_types, nodes) = std::thread::scope(|scope| {
        let nnum = scope.spawn(|| session.vget("NODE", "", "NLIST", ""));
        let elements = scope.spawn(|| session.load_elements());
        let element_types = scope.spawn(|| session.load_element_types());
        let nodes = scope.spawn(|| session.nodes());
        (
            nnum.join().map_err(|_| ClientError::WorkerPanicked("node numbers")),
            elements.join().map_err(|_| ClientError::WorkerPanicked("elements")),
            element_types
                .join()
                .map_err(|_| ClientError::WorkerPanicked("element types")),
            nodes.join().map_err(|_| ClientError::WorkerPanicked("nodes")),
        )
    });

    let nnum = number_list(&nnum??)?;
    let (elem, elem_off) = parse_elements(&int_values(&elements??, "element")?)?;
    let element_types = parse_element_types(&int_values(&element_types??, "element type")?)?;
    let nodes = parse_nodes(&nodes??)?;
    Ok(MeshData {
        nnum,
        nodes,
        elem,
        elem_off,
        element_types,
    })
}

fn int_values(array: &Array, what: &str) -> Result<Vec<i32>, ClientError> {
    array
        .as_slice::<i32>()
        .map(<[i32]>::to_vec)
        .ok_or_else(|| {
            ClientError::MalformedMesh(format!(
                "{} data is {}, expected int32",
                what,
                array.value_type()
            ))
        })
}

/// Node or element numbers from a list query; a lone `0` means none.
fn number_list(array: &Array) -> Result<Vec<i32>, ClientError> {
    let values = array
        .to_f64()
        .ok_or_else(|| ClientError::MalformedMesh("number list is complex".to_string()))?;
    if values == [0.0] {
        return Ok(Vec::new());
    }
    Ok(values.into_iter().map(|v| v as i32).collect())
}

/// Splits a flat N×3 coordinate array.
pub fn parse_nodes(array: &Array) -> Result<Vec<[f64; 3]>, ClientError> {
    let values = array
        .to_f64()
        .ok_or_else(|| ClientError::MalformedMesh("node coordinates are complex".to_string()))?;
    if values.len() % 3 != 0 {
        return Err(ClientError::MalformedMesh(format!(
            "{} coordinates do not form rows of three",
            values.len()
        )));
    }
    Ok(values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

/// Splits the raw connectivity array into the record array and its offsets.
///
/// `raw[0]` is the slot count `n` and `raw[..n]` are record starts in `raw`;
/// zero slots are unused. Offsets are rebased past the slot table and closed
/// with `raw.len() - n`.
pub fn parse_elements(raw: &[i32]) -> Result<(Vec<i32>, Vec<usize>), ClientError> {
    let Some(&n) = raw.first() else {
        return Ok((Vec::new(), Vec::new()));
    };
    let n = usize::try_from(n)
        .ok()
        .filter(|&n| n >= 1 && n <= raw.len())
        .ok_or_else(|| {
            ClientError::MalformedMesh(format!(
                "slot count {} does not fit {} values",
                n,
                raw.len()
            ))
        })?;

    let mut offsets = Vec::with_capacity(n + 1);
    for &slot in raw[..n].iter().filter(|&&s| s != 0) {
        let start = usize::try_from(slot)
            .ok()
            .and_then(|s| s.checked_sub(n))
            .ok_or_else(|| {
                ClientError::MalformedMesh(format!("record start {} inside slot table", slot))
            })?;
        offsets.push(start);
    }
    offsets.push(raw.len() - n);

    if offsets.windows(2).any(|w| w[0] > w[1]) {
        return Err(ClientError::MalformedMesh(
            "record starts are not ascending".to_string(),
        ));
    }
    Ok((raw[n..].to_vec(), offsets))
}

/// Splits the raw element type table.
///
/// `data[0]` is the slot count `n` and `data[1..=n]` are record starts in
/// `data`; zero slots are unused. Each record runs to the next start.
pub fn parse_element_types(data: &[i32]) -> Result<Vec<ElementType>, ClientError> {
    let Some(&n) = data.first() else {
        return Ok(Vec::new());
    };
    let n = usize::try_from(n)
        .ok()
        .filter(|&n| n < data.len())
        .ok_or_else(|| {
            ClientError::MalformedMesh(format!("element type table claims {} slots", n))
        })?;

    let mut starts = Vec::with_capacity(n);
    for &slot in data[1..=n].iter().filter(|&&s| s != 0) {
        let start = usize::try_from(slot)
            .ok()
            .filter(|&s| s > n && s <= data.len())
            .ok_or_else(|| {
                ClientError::MalformedMesh(format!("element type record at {}", slot))
            })?;
        starts.push(start);
    }
    starts.push(data.len());

    starts
        .windows(2)
        .map(|w| {
            let record = data.get(w[0]..w[1]).unwrap_or_default();
            if record.len() < 2 {
                return Err(ClientError::MalformedMesh(format!(
                    "element type record of {} values",
                    record.len()
                )));
            }
            let mut keyopts = [0; KEYOPT_COUNT];
            for (dst, src) in keyopts.iter_mut().zip(&record[2..]) {
                *dst = *src;
            }
            Ok(ElementType {
                number: record[0],
                routine: record[1],
                keyopts,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok, scripted, stream_of};
    use crate::transport::Reply;
    use femwire_protocol::{ChunkStream, Operation};
    use serde_json::json;

    /// Connectivity for `count` two-node line elements of type 1.
    fn line_elements(count: usize) -> Vec<i32> {
        let record_len = ELEM_HEADER_LEN + 2;
        let mut raw: Vec<i32> = (0..count)
            .map(|i| (count + i * record_len) as i32)
            .collect();
        for i in 0..count {
            let e = i as i32 + 1;
            raw.extend([1, 1, 1, 1, 0, 0, 0, 2, e, 0, e, e + 1]);
        }
        raw
    }

    fn element_types() -> Vec<i32> {
        // two slots, second unused
        let mut data = vec![2, 3, 0, 1, 188];
        data.extend(std::iter::repeat(0).take(KEYOPT_COUNT));
        data[5 + 2] = 4;
        data
    }

    struct Model {
        nodes: usize,
        elements: usize,
    }

    fn model_session(model: Model, commands: Arc<Mutex<Vec<String>>>) -> Session {
        scripted(move |req, _| match req.op {
            Operation::Run => {
                commands
                    .lock()
                    .push(req.params["command"].as_str().unwrap().to_string());
                Ok(ok(req, json!({ "output": "" })))
            }
            Operation::Vget => {
                let list: Vec<f64> = if model.nodes == 0 {
                    vec![0.0]
                } else {
                    (1..=model.nodes).map(|n| n as f64).collect()
                };
                Ok(stream_of(&Array::from(list), 64))
            }
            Operation::Nodes => {
                let coords: Vec<f64> = (0..model.nodes)
                    .flat_map(|i| [i as f64, 0.0, 0.0])
                    .collect();
                Ok(stream_of(&Array::from(coords), 64))
            }
            Operation::LoadElements => {
                if model.elements == 0 {
                    Ok(Reply::Stream(ChunkStream::new()))
                } else {
                    Ok(stream_of(&Array::from(line_elements(model.elements)), 64))
                }
            }
            Operation::LoadElementTypes => Ok(stream_of(&Array::from(element_types()), 64)),
            Operation::Get => Ok(ok(req, json!({ "value": model.nodes as f64 }))),
            other => panic!("unexpected {:?}", other),
        })
    }

    #[test]
    fn test_parse_elements_rebases_and_closes() {
        let raw = line_elements(9);
        let (elem, off) = parse_elements(&raw).unwrap();
        assert_eq!(off.len(), 10);
        assert_eq!(off[0], 0);
        assert_eq!(*off.last().unwrap(), raw.len() - 9);
        assert_eq!(elem.len(), 9 * 12);
        assert_eq!(&elem[off[8]..off[9]][ELEM_HEADER_LEN..], &[9, 10]);
    }

    #[test]
    fn test_parse_elements_drops_unused_slots() {
        // three slots, the middle one unused, two one-node records
        let mut raw = vec![3, 0, 14];
        raw.extend([1, 1, 0, 0, 0, 0, 0, 1, 1, 0, 1]);
        raw.extend([1, 1, 0, 0, 0, 0, 0, 1, 2, 0, 2]);
        let (elem, off) = parse_elements(&raw).unwrap();
        assert_eq!(off, vec![0, 11, 22]);
        assert_eq!(elem.len(), 22);
    }

    #[test]
    fn test_parse_elements_rejects_bad_slots() {
        assert!(parse_elements(&[]).unwrap().0.is_empty());
        assert!(matches!(
            parse_elements(&[5, 1]),
            Err(ClientError::MalformedMesh(_))
        ));
        assert!(matches!(
            parse_elements(&[2, 1, 0]),
            Err(ClientError::MalformedMesh(_))
        ));
    }

    #[test]
    fn test_parse_element_types() {
        let types = parse_element_types(&element_types()).unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].number, 1);
        assert_eq!(types[0].routine, 188);
        assert_eq!(types[0].keyopts[2], 4);
        assert!(parse_element_types(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_nodes_requires_rows_of_three() {
        let nodes = parse_nodes(&Array::from(vec![1.0f64, 2.0, 3.0])).unwrap();
        assert_eq!(nodes, vec![[1.0, 2.0, 3.0]]);
        assert!(parse_nodes(&Array::from(vec![1.0f64, 2.0])).is_err());
    }

    #[test]
    fn test_populate_line_model() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let session = model_session(
            Model {
                nodes: 10,
                elements: 9,
            },
            Arc::clone(&commands),
        );
        let mesh = session.mesh();

        assert_eq!(mesh.nodes().unwrap().len(), 10);
        assert_eq!(mesh.elem_off().unwrap().len(), 10);
        assert_eq!(mesh.nnum().unwrap(), (1..=10).collect::<Vec<i32>>());
        assert_eq!(mesh.elem_numbers().unwrap(), (1..=9).collect::<Vec<i32>>());
        assert_eq!(mesh.et_id().unwrap(), vec![1; 9]);
        assert_eq!(mesh.etype().unwrap(), vec![188; 9]);
        assert_eq!(mesh.tshape().unwrap(), vec![2; 9]);
        assert_eq!(mesh.tshape_key().unwrap(), BTreeMap::from([(1, 2)]));
        assert_eq!(mesh.key_option().unwrap(), BTreeMap::from([(1, vec![(3, 4)])]));
        assert_eq!(mesh.ekey().unwrap(), vec![(1, 188)]);
        assert_eq!(mesh.populate_count(), 1);

        assert_eq!(
            *commands.lock(),
            vec!["CM,__NODE__,NODE", "NSLE,S", "CMSEL,S,__NODE__,NODE", "CMDELE,__NODE__"]
        );
    }

    #[test]
    fn test_run_invalidates_and_repopulates_once() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let session = model_session(
            Model {
                nodes: 4,
                elements: 3,
            },
            commands,
        );
        let mesh = session.mesh();
        mesh.nodes().unwrap();
        assert!(mesh.is_populated());

        session.run("N,5,1,1,1").unwrap();
        assert!(!mesh.is_populated());

        mesh.nodes().unwrap();
        mesh.elem().unwrap();
        mesh.nnum().unwrap();
        assert_eq!(mesh.populate_count(), 2);
    }

    #[test]
    fn test_concurrent_readers_populate_once() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let session = model_session(
            Model {
                nodes: 10,
                elements: 9,
            },
            commands,
        );
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let session = session.clone();
                scope.spawn(move || {
                    assert_eq!(session.mesh().nodes().unwrap().len(), 10);
                });
            }
        });
        assert_eq!(session.mesh().populate_count(), 1);
    }

    #[test]
    fn test_empty_model() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let session = model_session(
            Model {
                nodes: 0,
                elements: 0,
            },
            commands,
        );
        let mesh = session.mesh();
        assert!(mesh.nnum().unwrap().is_empty());
        assert!(mesh.nodes().unwrap().is_empty());
        assert!(mesh.elem().unwrap().is_empty());
        assert!(mesh.elem_off().unwrap().is_empty());
        assert!(mesh.material_type().unwrap().is_empty());
        assert!(mesh.tshape_key().unwrap().is_empty());
    }

    #[test]
    fn test_failed_fetch_aborts_but_restores_selection() {
        let commands = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&commands);
        let session = scripted(move |req, _| match req.op {
            Operation::Run => {
                seen.lock()
                    .push(req.params["command"].as_str().unwrap().to_string());
                Ok(ok(req, json!({ "output": "" })))
            }
            Operation::LoadElements => Ok(Reply::Response(femwire_protocol::Response::error(
                &req.id,
                femwire_protocol::ResponseError::new(
                    femwire_protocol::ErrorCode::InternalError,
                    "no elements",
                ),
            ))),
            _ => Ok(stream_of(&Array::from(vec![0i32]), 64)),
        });

        let mesh = session.mesh();
        assert!(matches!(mesh.nodes(), Err(ClientError::Engine { .. })));
        assert!(!mesh.is_populated());
        assert_eq!(mesh.populate_count(), 0);
        let commands = commands.lock();
        assert_eq!(commands[commands.len() - 2], "CMSEL,S,__NODE__,NODE");
        assert_eq!(commands[commands.len() - 1], "CMDELE,__NODE__");
    }

    #[test]
    fn test_nnum_all_restores_selection() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let session = model_session(
            Model {
                nodes: 3,
                elements: 1,
            },
            Arc::clone(&commands),
        );
        let mesh = session.mesh();
        mesh.nodes().unwrap();
        commands.lock().clear();

        assert_eq!(mesh.nnum_all().unwrap(), vec![1, 2, 3]);
        assert!(mesh.is_populated());
        assert_eq!(
            *commands.lock(),
            vec!["CM,__NODE__,NODE", "NSEL,ALL", "CMSEL,S,__NODE__,NODE", "CMDELE,__NODE__"]
        );
        assert_eq!(mesh.n_node().unwrap(), 3);
    }

    #[test]
    fn test_select_all_waits_for_running_populate() {
        let commands = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&commands);
        let (fetching_tx, fetching_rx) = std::sync::mpsc::channel();
        let fetching_tx = Mutex::new(Some(fetching_tx));
        let session = scripted(move |req, _| match req.op {
            Operation::Run => {
                seen.lock()
                    .push(req.params["command"].as_str().unwrap().to_string());
                Ok(ok(req, json!({ "output": "" })))
            }
            Operation::LoadElements => {
                if let Some(tx) = fetching_tx.lock().take() {
                    tx.send(()).unwrap();
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
                Ok(Reply::Response(femwire_protocol::Response::error(
                    &req.id,
                    femwire_protocol::ResponseError::new(
                        femwire_protocol::ErrorCode::InternalError,
                        "no elements",
                    ),
                )))
            }
            _ => Ok(stream_of(&Array::from(vec![0.0f64]), 64)),
        });

        std::thread::scope(|scope| {
            let populating = session.clone();
            let populate = scope.spawn(move || populating.mesh().nodes());
            fetching_rx.recv().unwrap();
            assert!(session.mesh().nnum_all().unwrap().is_empty());
            assert!(populate.join().unwrap().is_err());
        });

        assert_eq!(
            *commands.lock(),
            vec![
                "CM,__NODE__,NODE",
                "NSLE,S",
                "CMSEL,S,__NODE__,NODE",
                "CMDELE,__NODE__",
                "CM,__NODE__,NODE",
                "NSEL,ALL",
                "CMSEL,S,__NODE__,NODE",
                "CMDELE,__NODE__",
            ]
        );
    }

    #[test]
    fn test_mesh_outliving_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let session = scripted(move |req, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(ok(req, json!({ "output": "" })))
        });
        let weak = session.downgrade();
        let cache = MeshCache::new(weak);
        drop(session);
        assert!(matches!(cache.nodes(), Err(ClientError::SessionTerminated(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
