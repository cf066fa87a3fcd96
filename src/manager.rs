// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

//! Device-side data of the nonbonded module and the per-step work on it.
//!
//! A step on two streams runs in this order:
//!
//! 1. `copy_xq_to_gpu(Local)`, which marks that local uploads are done
//! 2. `copy_xq_to_gpu(NonLocal)`, which waits for that mark
//! 3. `launch_kernel` per locality
//! 4. `launch_cpyback(NonLocal)`, which marks that non-local downloads are done
//! 5. `launch_cpyback(Local)`, which waits for that mark, then sums up and
//!    downloads energies and shift forces
//! 6. `wait_finish` per locality
//!
//! A non-local locality without work skips its uploads and downloads and
//! resets the events instead.

use crate::atomdata::NbAtomData;
use crate::config::{InteractionConst, KernelOverrides, PairlistParams};
use crate::constants::{CLUSTER_PAIR_SPLIT, ENERGY_MEMORY_SIZE, NUM_SHIFT_VECTORS, SHIFT_MEMORY_SIZE};
use crate::device::{over_alloc_large, over_alloc_small, Device, DeviceArray, GpuEventSynchronizer, KernelArgs};
use crate::error::NbnxmError;
use crate::kernel::{
    pick_elec_kernel_type, pick_ewald_kernel_type, pick_vdw_kernel_type, ElecType, Kernel, KernelFlavor,
    LaunchParams, NbParam, VdwType,
};
use crate::locality::{AtomLocality, InteractionLocality, StepWork};
use crate::pairlist::{ExclusionMask, HostPairlist, JClusterGroup, SuperClusterEntry};
use anyhow::Result;
use std::ops::Range;

/// Energies and shift forces accumulated over [`NonbondedGpu::wait_finish`] calls
#[derive(Debug, Clone, PartialEq)]
pub struct NbOutputs {
    pub e_lj: f64,
    pub e_el: f64,
    /// One force per shift vector, for the virial
    pub fshift: Vec<[f64; 3]>,
}

impl Default for NbOutputs {
    fn default() -> Self {
        Self {
            e_lj: 0.0,
            e_el: 0.0,
            fshift: vec![[0.0; 3]; NUM_SHIFT_VECTORS],
        }
    }
}

impl NbOutputs {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Counters of transfers and launches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NbStatistics {
    /// Steps with a local force download
    pub num_steps: usize,
    pub pairlist_uploads: usize,
    /// Nonbonded launches indexed by `[calc_energies][prune]`
    pub kernel_launches: [[usize; 2]; 2],
    /// Prune-only launches on a fresh list
    pub dynamic_prune_launches: usize,
    pub rolling_prune_launches: usize,
    pub bytes_to_device: usize,
    pub bytes_from_device: usize,
}

impl NbStatistics {
    fn uploaded<T>(&mut self, len: usize) {
        self.bytes_to_device += len * std::mem::size_of::<T>();
    }

    fn downloaded<T>(&mut self, len: usize) {
        self.bytes_from_device += len * std::mem::size_of::<T>();
    }
}

/// Parameter tables; the ones a flavour does not read hold a single element
struct ParamTables<D: Device> {
    param: D::Buffer<NbParam>,
    nbfp: DeviceArray<D, [f32; 2]>,
    nbfp_comb: DeviceArray<D, [f32; 2]>,
    coulomb_tab: DeviceArray<D, f32>,
}

struct AtomDataGpu<D: Device> {
    /// None until the first `init_atomdata`
    num_atoms: Option<usize>,
    num_atoms_local: usize,
    xq: DeviceArray<D, [f32; 4]>,
    f: DeviceArray<D, [f32; 3]>,
    atom_types: DeviceArray<D, i32>,
    lj_comb: DeviceArray<D, [f32; 2]>,
    shift_vec: D::Buffer<[f32; 4]>,
    shift_vec_uploaded: bool,
    fshift: D::Buffer<[f32; 3]>,
    e_lj: D::Buffer<f32>,
    e_el: D::Buffer<f32>,
}

impl<D: Device> AtomDataGpu<D> {
    fn new(device: &D) -> Result<Self> {
        Ok(Self {
            num_atoms: None,
            num_atoms_local: 0,
            xq: DeviceArray::new(device, "xq")?,
            f: DeviceArray::new(device, "f")?,
            atom_types: DeviceArray::new(device, "atom_types")?,
            lj_comb: DeviceArray::new(device, "lj_comb")?,
            shift_vec: device.allocate(NUM_SHIFT_VECTORS, "shift_vec")?,
            shift_vec_uploaded: false,
            fshift: device.allocate(NUM_SHIFT_VECTORS * SHIFT_MEMORY_SIZE, "fshift")?,
            e_lj: device.allocate(ENERGY_MEMORY_SIZE, "e_lj")?,
            e_el: device.allocate(ENERGY_MEMORY_SIZE, "e_el")?,
        })
    }

    fn atom_range(&self, locality: AtomLocality) -> Result<Range<usize>> {
        let num_atoms = self.num_atoms.ok_or(NbnxmError::MissingAtomData)?;
        Ok(locality.atom_range(self.num_atoms_local, num_atoms))
    }
}

struct GpuPairlist<D: Device> {
    /// Atoms per cluster of the first list
    na_c: Option<usize>,
    sci: DeviceArray<D, SuperClusterEntry>,
    cj4: DeviceArray<D, JClusterGroup>,
    /// Masks pruned with the outer radius, two per j-group
    imask_outer: DeviceArray<D, u32>,
    excl: DeviceArray<D, ExclusionMask>,
    /// Atoms the list references
    num_atoms_required: usize,
    have_fresh_list: bool,
    rolling_prune_part: u32,
    rolling_prune_num_parts: u32,
}

impl<D: Device> GpuPairlist<D> {
    fn new(device: &D) -> Result<Self> {
        Ok(Self {
            na_c: None,
            sci: DeviceArray::new(device, "sci")?,
            cj4: DeviceArray::new(device, "cj4")?,
            imask_outer: DeviceArray::new(device, "imask_outer")?,
            excl: DeviceArray::new(device, "excl")?,
            num_atoms_required: 0,
            have_fresh_list: false,
            rolling_prune_part: 0,
            rolling_prune_num_parts: 0,
        })
    }

    fn num_sci(&self) -> u32 {
        self.sci.len() as u32
    }

    /// Fails unless every atom the list references is on the device
    fn check_atoms_uploaded(&self, num_atoms: Option<usize>) -> Result<()> {
        let num_atoms = num_atoms.ok_or(NbnxmError::MissingAtomData)?;
        if self.num_atoms_required > num_atoms {
            return Err(NbnxmError::InvalidPairlist(format!(
                "list needs {} atoms, {num_atoms} uploaded",
                self.num_atoms_required
            ))
            .into());
        }
        Ok(())
    }
}

/// Downloads enqueued by `launch_cpyback`, read back in `wait_finish`
struct PendingDownloads<D: Device> {
    f: Option<(Range<usize>, D::Download<[f32; 3]>)>,
    fshift: Option<D::Download<[f32; 3]>>,
    energies: Option<(D::Download<f32>, D::Download<f32>)>,
}

struct LocalityData<D: Device> {
    stream: D::Stream,
    plist: GpuPairlist<D>,
    have_work: bool,
    pending: Option<PendingDownloads<D>>,
}

/// Buffers bound to a launch over `plist`
fn kernel_args<'a, D: Device>(
    atdat: &'a AtomDataGpu<D>,
    tables: &'a ParamTables<D>,
    plist: &'a GpuPairlist<D>,
    launch: LaunchParams,
) -> KernelArgs<'a, D> {
    KernelArgs {
        param: &tables.param,
        launch,
        xq: atdat.xq.buffer(),
        f: atdat.f.buffer(),
        shift_vec: &atdat.shift_vec,
        fshift: &atdat.fshift,
        e_lj: &atdat.e_lj,
        e_el: &atdat.e_el,
        atom_types: atdat.atom_types.buffer(),
        lj_comb: atdat.lj_comb.buffer(),
        nbfp: tables.nbfp.buffer(),
        nbfp_comb: tables.nbfp_comb.buffer(),
        coulomb_tab: tables.coulomb_tab.buffer(),
        sci: plist.sci.buffer(),
        cj4: plist.cj4.buffer(),
        excl: plist.excl.buffer(),
        imask_outer: plist.imask_outer.buffer(),
    }
}

/// Nonbonded interactions on a device.
///
/// Owns every device buffer; dropping it releases them.
pub struct NonbondedGpu<D: Device> {
    device: D,
    elec_type: ElecType,
    vdw_type: VdwType,
    overrides: KernelOverrides,
    list_params: PairlistParams,
    nbparam: NbParam,
    tables: ParamTables<D>,
    atdat: AtomDataGpu<D>,
    localities: [Option<LocalityData<D>>; 2],
    /// Local uploads and clears are done; non-local work may start
    misc_ops_and_local_h2d_done: GpuEventSynchronizer<D>,
    /// Non-local forces are downloaded; the local download may start
    nonlocal_done: GpuEventSynchronizer<D>,
    statistics: NbStatistics,
}

impl<D: Device> NonbondedGpu<D> {
    /// Sets up the device data with Ewald overrides taken from the environment
    pub fn new(
        device: D,
        ic: &InteractionConst,
        list_params: &PairlistParams,
        nbat: &NbAtomData,
        local_and_nonlocal: bool,
    ) -> Result<Self> {
        Self::with_overrides(device, ic, list_params, nbat, local_and_nonlocal, KernelOverrides::from_env())
    }

    /// Picks the kernel flavour and uploads the parameter tables.
    ///
    /// With `local_and_nonlocal` a second stream and pairlist are created for
    /// interactions with halo atoms.
    pub fn with_overrides(
        device: D,
        ic: &InteractionConst,
        list_params: &PairlistParams,
        nbat: &NbAtomData,
        local_and_nonlocal: bool,
        overrides: KernelOverrides,
    ) -> Result<Self> {
        let elec_type = pick_elec_kernel_type(ic, &overrides, device.prefers_tabulated_ewald())?;
        let vdw_type = pick_vdw_kernel_type(ic, nbat.comb_rule)?;
        let nbparam = NbParam::new(ic, list_params, nbat.num_types());

        let local = LocalityData {
            stream: device.create_stream("local")?,
            plist: GpuPairlist::new(&device)?,
            have_work: false,
            pending: None,
        };
        let nonlocal = if local_and_nonlocal {
            Some(LocalityData {
                stream: device.create_stream("nonlocal")?,
                plist: GpuPairlist::new(&device)?,
                have_work: false,
                pending: None,
            })
        } else {
            None
        };

        let stream = &local.stream;
        let param = device.allocate(1, "nbparam")?;
        device.copy_to_device(stream, &param, 0, &[nbparam])?;
        let mut statistics = NbStatistics::default();
        statistics.uploaded::<NbParam>(1);

        // Flavours that combine per-atom parameters never read the type matrix
        let nbfp = if vdw_type.uses_combination_rule() {
            DeviceArray::new(&device, "nbfp")?
        } else {
            statistics.uploaded::<[f32; 2]>(nbat.nbfp.len());
            DeviceArray::from_slice(&device, stream, "nbfp", &nbat.nbfp)?
        };
        let nbfp_comb = if vdw_type.is_ewald() {
            statistics.uploaded::<[f32; 2]>(nbat.nbfp_comb.len());
            DeviceArray::from_slice(&device, stream, "nbfp_comb", &nbat.nbfp_comb)?
        } else {
            DeviceArray::new(&device, "nbfp_comb")?
        };
        let mut tables = ParamTables {
            param,
            nbfp,
            nbfp_comb,
            coulomb_tab: DeviceArray::new(&device, "coulomb_tab")?,
        };
        if elec_type.is_tabulated() {
            Self::upload_ewald_table(&device, stream, &mut tables, ic, &mut statistics)?;
        }
        let atdat = AtomDataGpu::new(&device)?;
        device.flush(stream)?;

        info!(
            "Initialized nonbonded data on {} with {} streams, kernel Elec{:?}_Vdw{:?}",
            device.name(),
            if local_and_nonlocal { 2 } else { 1 },
            elec_type,
            vdw_type
        );

        Ok(Self {
            device,
            elec_type,
            vdw_type,
            overrides,
            list_params: *list_params,
            nbparam,
            tables,
            atdat,
            localities: [Some(local), nonlocal],
            misc_ops_and_local_h2d_done: GpuEventSynchronizer::new(),
            nonlocal_done: GpuEventSynchronizer::new(),
            statistics,
        })
    }

    fn upload_ewald_table(
        device: &D,
        stream: &D::Stream,
        tables: &mut ParamTables<D>,
        ic: &InteractionConst,
        statistics: &mut NbStatistics,
    ) -> Result<()> {
        let table = ic
            .coulomb_ewald_tables
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Tabulated Ewald kernel without a correction table"))?;
        tables.coulomb_tab.reallocate(device, table.len(), |n| n)?;
        tables.coulomb_tab.upload(device, stream, 0, &table.table_f)?;
        statistics.uploaded::<f32>(table.len());
        Ok(())
    }

    fn locality(localities: &[Option<LocalityData<D>>; 2], iloc: InteractionLocality) -> Result<&LocalityData<D>> {
        localities[iloc.index()]
            .as_ref()
            .ok_or_else(|| NbnxmError::MissingLocality(iloc.to_string()).into())
    }

    fn locality_mut(
        localities: &mut [Option<LocalityData<D>>; 2],
        iloc: InteractionLocality,
    ) -> Result<&mut LocalityData<D>> {
        localities[iloc.index()]
            .as_mut()
            .ok_or_else(|| NbnxmError::MissingLocality(iloc.to_string()).into())
    }

    fn local_stream(&self) -> Result<&D::Stream> {
        Ok(&Self::locality(&self.localities, InteractionLocality::Local)?.stream)
    }

    fn use_two_streams(&self) -> bool {
        self.localities[InteractionLocality::NonLocal.index()].is_some()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Kernel flavour used by a launch with the given energy and prune flags
    pub fn kernel_flavor(&self, calc_energies: bool, prune: bool) -> KernelFlavor {
        KernelFlavor {
            elec: self.elec_type,
            vdw: self.vdw_type,
            calc_energies,
            prune,
        }
    }

    /// New Coulomb cut-off and Ewald coefficient after PME tuning
    pub fn update_pme_load_balancing_params(&mut self, ic: &InteractionConst) -> Result<()> {
        anyhow::ensure!(
            self.elec_type.is_ewald(),
            "PME load balancing needs Ewald electrostatics"
        );
        self.nbparam.set_cutoff_parameters(ic, &self.list_params);
        self.elec_type = pick_ewald_kernel_type(ic, &self.overrides, self.device.prefers_tabulated_ewald())?;
        let stream = &Self::locality(&self.localities, InteractionLocality::Local)?.stream;
        self.device.copy_to_device(stream, &self.tables.param, 0, &[self.nbparam])?;
        self.statistics.uploaded::<NbParam>(1);
        if self.elec_type.is_tabulated() {
            Self::upload_ewald_table(&self.device, stream, &mut self.tables, ic, &mut self.statistics)?;
        }
        debug!("Load balanced rcoulomb {} with {:?}", ic.rcoulomb, self.elec_type);
        Ok(())
    }

    /// Uploads the shift vectors if the box changes or they were never uploaded
    pub fn upload_shift_vectors(&mut self, nbat: &NbAtomData) -> Result<()> {
        if nbat.dynamic_box || !self.atdat.shift_vec_uploaded {
            let stream = &Self::locality(&self.localities, InteractionLocality::Local)?.stream;
            self.device.copy_to_device(stream, &self.atdat.shift_vec, 0, &nbat.shift_vec)?;
            self.statistics.uploaded::<[f32; 4]>(nbat.shift_vec.len());
            self.atdat.shift_vec_uploaded = true;
        }
        Ok(())
    }

    /// Uploads a new pairlist on the locality's stream and marks it fresh
    pub fn init_pairlist(&mut self, list: &HostPairlist, iloc: InteractionLocality) -> Result<()> {
        let loc = Self::locality_mut(&mut self.localities, iloc)?;
        let plist = &mut loc.plist;
        match plist.na_c {
            Some(previous) if previous != list.na_ci => {
                return Err(NbnxmError::ClusterSizeChanged {
                    previous,
                    current: list.na_ci,
                }
                .into())
            }
            _ => plist.na_c = Some(list.na_ci),
        }
        plist.num_atoms_required = list.validate()?;

        let (device, stream) = (&self.device, &loc.stream);
        plist.sci.reallocate(device, list.sci.len(), over_alloc_large)?;
        plist.sci.upload(device, stream, 0, &list.sci)?;
        plist.cj4.reallocate(device, list.cj4.len(), over_alloc_large)?;
        plist.cj4.upload(device, stream, 0, &list.cj4)?;
        plist
            .imask_outer
            .reallocate(device, list.cj4.len() * CLUSTER_PAIR_SPLIT, over_alloc_large)?;
        plist.excl.reallocate(device, list.excl.len(), over_alloc_large)?;
        plist.excl.upload(device, stream, 0, &list.excl)?;

        self.statistics.pairlist_uploads += 1;
        self.statistics.uploaded::<SuperClusterEntry>(list.sci.len());
        self.statistics.uploaded::<JClusterGroup>(list.cj4.len());
        self.statistics.uploaded::<ExclusionMask>(list.excl.len());
        plist.have_fresh_list = true;
        plist.rolling_prune_part = 0;
        trace!(
            "{iloc} pairlist: {} super-clusters, {} j-groups",
            list.sci.len(),
            list.cj4.len()
        );
        Ok(())
    }

    /// Resizes the atom arrays and uploads types or combination parameters
    pub fn init_atomdata(&mut self, nbat: &NbAtomData) -> Result<()> {
        let stream = &Self::locality(&self.localities, InteractionLocality::Local)?.stream;
        let device = &self.device;
        let atdat = &mut self.atdat;
        let num_atoms = nbat.num_atoms();

        let realloced = atdat.xq.reallocate(device, num_atoms, over_alloc_small)?
            | atdat.f.reallocate(device, num_atoms, over_alloc_small)?;
        if realloced {
            info!("Reallocated device atom data for {num_atoms} atoms");
            device.clear(stream, atdat.f.buffer(), 0..atdat.f.capacity())?;
        }
        if self.vdw_type.uses_combination_rule() {
            atdat.lj_comb.reallocate(device, num_atoms, over_alloc_small)?;
            atdat.lj_comb.upload(device, stream, 0, &nbat.lj_comb)?;
            self.statistics.uploaded::<[f32; 2]>(num_atoms);
        } else {
            atdat.atom_types.reallocate(device, num_atoms, over_alloc_small)?;
            atdat.atom_types.upload(device, stream, 0, &nbat.atom_types)?;
            self.statistics.uploaded::<i32>(num_atoms);
        }
        atdat.num_atoms = Some(num_atoms);
        atdat.num_atoms_local = nbat.num_local;
        device.flush(stream)
    }

    /// Zeroes the forces, and shift forces and energies when the virial is computed
    pub fn clear_outputs(&mut self, compute_virial: bool) -> Result<()> {
        let stream = self.local_stream()?;
        let num_atoms = self.atdat.num_atoms.unwrap_or(0);
        self.device.clear(stream, self.atdat.f.buffer(), 0..num_atoms)?;
        if compute_virial {
            self.device
                .clear(stream, &self.atdat.fshift, 0..NUM_SHIFT_VECTORS * SHIFT_MEMORY_SIZE)?;
            self.device.clear(stream, &self.atdat.e_lj, 0..ENERGY_MEMORY_SIZE)?;
            self.device.clear(stream, &self.atdat.e_el, 0..ENERGY_MEMORY_SIZE)?;
        }
        self.device.flush(stream)
    }

    /// Records whether a locality has work: a non-empty list or other
    /// interactions reading the same coordinates
    pub fn setup_short_range_work(&mut self, iloc: InteractionLocality, have_other_work: bool) -> Result<()> {
        let loc = Self::locality_mut(&mut self.localities, iloc)?;
        loc.have_work = !loc.plist.sci.is_empty() || have_other_work;
        Ok(())
    }

    pub fn have_short_range_work(&self, iloc: InteractionLocality) -> bool {
        Self::locality(&self.localities, iloc).is_ok_and(|loc| loc.have_work)
    }

    /// Uploads positions and charges of one atom locality
    pub fn copy_xq_to_gpu(&mut self, nbat: &NbAtomData, locality: AtomLocality) -> Result<()> {
        let iloc = locality.interaction_locality()?;
        let loc = Self::locality_mut(&mut self.localities, iloc)?;
        if iloc == InteractionLocality::NonLocal && !loc.have_work {
            // Nothing reads the halo coordinates
            loc.plist.have_fresh_list = false;
            self.misc_ops_and_local_h2d_done.reset();
            return Ok(());
        }
        let range = self.atdat.atom_range(locality)?;
        anyhow::ensure!(
            nbat.num_atoms() == self.atdat.num_atoms.unwrap_or(0),
            "Atom count changed without init_atomdata"
        );
        self.atdat
            .xq
            .upload(&self.device, &loc.stream, range.start, &nbat.xq[range.clone()])?;
        self.statistics.uploaded::<[f32; 4]>(range.len());
        self.insert_nonlocal_dependency(iloc)
    }

    /// The local stream marks its uploads done; the non-local stream waits for that
    pub fn insert_nonlocal_dependency(&mut self, iloc: InteractionLocality) -> Result<()> {
        if !self.use_two_streams() {
            return Ok(());
        }
        let stream = &Self::locality(&self.localities, iloc)?.stream;
        match iloc {
            InteractionLocality::Local => {
                self.misc_ops_and_local_h2d_done.mark(&self.device, stream)?;
                self.device.flush(stream)
            }
            InteractionLocality::NonLocal => self.misc_ops_and_local_h2d_done.enqueue_wait(&self.device, stream),
        }
    }

    /// Launches the nonbonded kernel; a fresh list is pruned on the way
    pub fn launch_kernel(&mut self, iloc: InteractionLocality, step_work: &StepWork) -> Result<()> {
        if self.atdat.num_atoms.is_none() {
            return Err(NbnxmError::MissingAtomData.into());
        }
        let loc = Self::locality_mut(&mut self.localities, iloc)?;
        let plist = &mut loc.plist;
        if plist.sci.is_empty() {
            // Empty launches are not allowed on every device
            plist.have_fresh_list = false;
            return Ok(());
        }
        plist.check_atoms_uploaded(self.atdat.num_atoms)?;
        let prune = plist.have_fresh_list;
        let flavor = KernelFlavor {
            elec: self.elec_type,
            vdw: self.vdw_type,
            calc_energies: step_work.compute_energy,
            prune,
        };
        let launch = LaunchParams {
            num_sci: plist.num_sci(),
            calc_fshift: step_work.compute_virial as u32,
            have_fresh_list: prune as u32,
            ..Default::default()
        };
        let loc = Self::locality(&self.localities, iloc)?;
        let args = kernel_args(&self.atdat, &self.tables, &loc.plist, launch);
        self.device.launch(&loc.stream, Kernel::Nonbonded(flavor), &args)?;
        self.statistics.kernel_launches[step_work.compute_energy as usize][prune as usize] += 1;
        Ok(())
    }

    /// Prunes the list with the inner radius.
    ///
    /// On a fresh list the whole list is pruned and the outer masks are
    /// stored. Later calls prune one of `num_parts` interleaved parts each,
    /// cycling through the parts.
    pub fn launch_prune_only(&mut self, iloc: InteractionLocality, num_parts: u32) -> Result<()> {
        anyhow::ensure!(num_parts > 0, "Pruning needs at least one part");
        let loc = Self::locality_mut(&mut self.localities, iloc)?;
        let plist = &mut loc.plist;
        if !plist.sci.is_empty() {
            plist.check_atoms_uploaded(self.atdat.num_atoms)?;
        }
        let fresh = plist.have_fresh_list;
        let (part, parts) = if fresh {
            plist.rolling_prune_part = 0;
            plist.rolling_prune_num_parts = num_parts;
            (0, 1)
        } else {
            if plist.rolling_prune_num_parts != num_parts {
                plist.rolling_prune_num_parts = num_parts;
                plist.rolling_prune_part = 0;
            }
            let part = plist.rolling_prune_part;
            plist.rolling_prune_part = (part + 1) % num_parts;
            (part, num_parts)
        };
        plist.have_fresh_list = false;
        if plist.sci.is_empty() {
            return Ok(());
        }
        let launch = LaunchParams {
            num_sci: plist.num_sci(),
            prune_part: part,
            prune_num_parts: parts,
            have_fresh_list: fresh as u32,
            ..Default::default()
        };
        let loc = Self::locality(&self.localities, iloc)?;
        let args = kernel_args(&self.atdat, &self.tables, &loc.plist, launch);
        self.device.launch(&loc.stream, Kernel::PruneOnly, &args)?;
        if fresh {
            self.statistics.dynamic_prune_launches += 1;
        } else {
            self.statistics.rolling_prune_launches += 1;
        }
        Ok(())
    }

    /// Enqueues the downloads of forces and, for the local part, shift forces and energies
    pub fn launch_cpyback(&mut self, locality: AtomLocality, step_work: &StepWork) -> Result<()> {
        let iloc = locality.interaction_locality()?;
        let loc = Self::locality_mut(&mut self.localities, iloc)?;
        if iloc == InteractionLocality::NonLocal && !loc.have_work {
            self.nonlocal_done.reset();
            return Ok(());
        }
        let range = self.atdat.atom_range(locality)?;
        let (device, stream) = (&self.device, &loc.stream);

        // Local forces include contributions from the non-local kernel
        if iloc == InteractionLocality::Local && self.nonlocal_done.is_pending() {
            self.nonlocal_done.enqueue_wait(device, stream)?;
        }

        let mut pending = PendingDownloads {
            f: None,
            fshift: None,
            energies: None,
        };
        if !step_work.use_gpu_f_buffer_ops {
            let download = device.copy_from_device(stream, self.atdat.f.buffer(), range.clone())?;
            self.statistics.downloaded::<[f32; 3]>(range.len());
            pending.f = Some((range, download));
            device.flush(stream)?;
        }

        match iloc {
            InteractionLocality::NonLocal => self.nonlocal_done.mark(device, stream)?,
            InteractionLocality::Local => {
                if step_work.compute_energy || step_work.compute_virial {
                    let launch = LaunchParams {
                        sum_energies: step_work.compute_energy as u32,
                        sum_fshift: step_work.compute_virial as u32,
                        ..Default::default()
                    };
                    let args = kernel_args(&self.atdat, &self.tables, &loc.plist, launch);
                    device.launch(stream, Kernel::SumUp, &args)?;
                }
                if step_work.compute_virial {
                    pending.fshift = Some(device.copy_from_device(stream, &self.atdat.fshift, 0..NUM_SHIFT_VECTORS)?);
                    self.statistics.downloaded::<[f32; 3]>(NUM_SHIFT_VECTORS);
                }
                if step_work.compute_energy {
                    pending.energies = Some((
                        device.copy_from_device(stream, &self.atdat.e_lj, 0..1)?,
                        device.copy_from_device(stream, &self.atdat.e_el, 0..1)?,
                    ));
                    self.statistics.downloaded::<f32>(2);
                }
                self.statistics.num_steps += 1;
            }
        }
        loc.pending = Some(pending);
        Ok(())
    }

    /// Waits for the locality's stream and moves the downloaded results into
    /// `nbat.f` and `outputs`
    pub fn wait_finish(
        &mut self,
        locality: AtomLocality,
        nbat: &mut NbAtomData,
        outputs: &mut NbOutputs,
    ) -> Result<()> {
        let iloc = locality.interaction_locality()?;
        let loc = Self::locality_mut(&mut self.localities, iloc)?;
        if iloc == InteractionLocality::NonLocal && !loc.have_work {
            return Ok(());
        }
        self.device.synchronize(&loc.stream)?;
        loc.plist.have_fresh_list = false;
        let Some(pending) = loc.pending.take() else {
            return Ok(());
        };
        if let Some((range, download)) = pending.f {
            let forces = self.device.fetch(download)?;
            anyhow::ensure!(nbat.f.len() >= range.end, "Host force buffer too small");
            nbat.f[range].copy_from_slice(&forces);
        }
        if let Some(download) = pending.fshift {
            for (acc, f) in outputs.fshift.iter_mut().zip(self.device.fetch(download)?) {
                (0..3).for_each(|d| acc[d] += f[d] as f64);
            }
        }
        if let Some((e_lj, e_el)) = pending.energies {
            outputs.e_lj += self.device.fetch(e_lj)?.iter().map(|&e| e as f64).sum::<f64>();
            outputs.e_el += self.device.fetch(e_el)?.iter().map(|&e| e as f64).sum::<f64>();
        }
        Ok(())
    }

    /// Device force buffer, e.g. for a reduction that stays on the device
    pub fn forces_buffer(&self) -> &D::Buffer<[f32; 3]> {
        self.atdat.f.buffer()
    }

    pub fn is_kernel_ewald_analytical(&self) -> bool {
        self.elec_type.is_analytical()
    }

    pub fn statistics(&self) -> &NbStatistics {
        &self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics = NbStatistics::default();
    }
}

impl<D: Device> Drop for NonbondedGpu<D> {
    fn drop(&mut self) {
        debug!(
            "Releasing nonbonded data on {} after {} steps",
            self.device.name(),
            self.statistics.num_steps
        );
    }
}
