use crate::device::TransportKind;
use crate::diff::{ConfigDiff, VlanChange};
use crate::error::SwitchcraftError;
use crate::model::{DeviceConfig, PortId, PortSpeed, Vlan};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Which diff element produced a command; partial failures are attributed
/// through this tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandTag {
    VlanCreate(u16),
    VlanModify(u16),
    VlanDelete(u16),
    PortConfigure(PortId),
    Setting(String),
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedCommand {
    pub command: String,
    pub tag: CommandTag,
}

impl TaggedCommand {
    fn new(command: impl Into<String>, tag: CommandTag) -> Self {
        Self {
            command: command.into(),
            tag,
        }
    }
}

/// Ordered command plan for one device. `rollback_commands` undo the forward
/// commands and are stored in execution order (inverses emitted in reverse).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPlan {
    pub pre_commands: Vec<TaggedCommand>,
    pub main_commands: Vec<TaggedCommand>,
    pub post_commands: Vec<TaggedCommand>,
    pub rollback_commands: Vec<TaggedCommand>,
}

impl CommandPlan {
    pub fn is_empty(&self) -> bool {
        self.main_commands.is_empty() && self.pre_commands.is_empty()
    }

    /// Flat command text in execution order, for display and audit.
    pub fn render(&self) -> Vec<String> {
        self.pre_commands
            .iter()
            .chain(self.main_commands.iter())
            .chain(self.post_commands.iter())
            .map(|c| c.command.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// Persist configuration after a successful apply (Brocade `write
    /// memory`, OpenWrt `uci commit`).
    pub save_on_success: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            save_on_success: true,
        }
    }
}

/// Build a vendor command plan from a diff.
///
/// The differ decides WHAT changes; this decides HOW and in what order, and
/// emits the rollback inverse for every forward step.
pub fn build_plan(
    kind: TransportKind,
    diff: &ConfigDiff,
    current: &DeviceConfig,
    opts: PlanOptions,
) -> Result<CommandPlan, SwitchcraftError> {
    let plan = match kind {
        TransportKind::BrocadeTelnet => plan_brocade(diff, current, opts),
        TransportKind::OpenWrtSsh => plan_openwrt(diff, current, opts),
        TransportKind::ZyxelCli | TransportKind::ZyxelHttps => plan_zyxel(diff, current),
    };
    debug!(
        target: "plan::build_plan",
        device_id = %current.device_id,
        transport = %kind,
        pre = plan.pre_commands.len(),
        main = plan.main_commands.len(),
        post = plan.post_commands.len(),
        rollback = plan.rollback_commands.len(),
        "built command plan"
    );
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Brocade
// ---------------------------------------------------------------------------

/// Collapse a port set into `ethe` clauses, ranges within one unit/module:
/// `ethe 1/1/5 to 1/1/8 ethe 1/2/1`. One range command is roughly an order
/// of magnitude faster than per-port commands on FastIron.
pub fn brocade_ethe_clauses(ports: &BTreeSet<PortId>) -> String {
    fn flush(run: &mut Option<(u8, u8, u16, u16)>, clauses: &mut Vec<String>) {
        if let Some((u, m, start, end)) = run.take() {
            if start == end {
                clauses.push(format!("ethe {}/{}/{}", u, m, start));
            } else {
                clauses.push(format!("ethe {}/{}/{} to {}/{}/{}", u, m, start, u, m, end));
            }
        }
    }

    let mut clauses: Vec<String> = Vec::new();
    let mut run: Option<(u8, u8, u16, u16)> = None;

    for port in ports {
        let (u, m, p) = match port {
            PortId::Stacked { unit, module, port } => (*unit, *module, *port),
            other => {
                flush(&mut run, &mut clauses);
                clauses.push(format!("ethe {}", other));
                continue;
            }
        };
        match run {
            Some((ru, rm, start, end)) if ru == u && rm == m && p == end + 1 => {
                run = Some((ru, rm, start, p));
            }
            _ => {
                flush(&mut run, &mut clauses);
                run = Some((u, m, p, p));
            }
        }
    }
    flush(&mut run, &mut clauses);
    clauses.join(" ")
}

fn brocade_speed(speed: PortSpeed) -> &'static str {
    match speed {
        PortSpeed::Auto => "auto",
        PortSpeed::TenHalf => "10-half",
        PortSpeed::TenFull => "10-full",
        PortSpeed::HundredHalf => "100-half",
        PortSpeed::HundredFull => "100-full",
        PortSpeed::GigFull => "1000-full",
        PortSpeed::TenGig => "10g-full",
    }
}

/// Ports gaining untagged membership in created or modified VLANs.
fn gained_untagged(diff: &ConfigDiff) -> Vec<(u16, PortId)> {
    let mut out = Vec::new();
    for vlan in &diff.vlans_to_create {
        for port in &vlan.untagged_ports {
            out.push((vlan.id, port.clone()));
        }
    }
    for change in &diff.vlans_to_modify {
        for port in change.after.untagged_ports.difference(&change.before.untagged_ports) {
            out.push((change.after.id, port.clone()));
        }
    }
    out
}

fn plan_brocade(diff: &ConfigDiff, current: &DeviceConfig, opts: PlanOptions) -> CommandPlan {
    let mut plan = CommandPlan::default();
    // Rollback blocks accumulate forward-order and are reversed at the end.
    let mut rollback_blocks: Vec<Vec<TaggedCommand>> = Vec::new();

    plan.pre_commands
        .push(TaggedCommand::new("configure terminal", CommandTag::Session));

    let deleted_ids: BTreeSet<u16> = diff.vlans_to_delete.iter().map(|v| v.id).collect();

    // A port can be untagged in only one VLAN at a time; ports moving into a
    // new untagged membership must leave their current VLAN first. Grouped by
    // source VLAN so ranges collapse.
    let mut evictions: BTreeMap<u16, BTreeSet<PortId>> = BTreeMap::new();
    for (target_vlan, port) in gained_untagged(diff) {
        if let Some(src) = current.untagged_vlan_of(&port) {
            if src.id != target_vlan && !deleted_ids.contains(&src.id) {
                evictions.entry(src.id).or_default().insert(port.clone());
            }
        }
        // Dual-mode must come off before the untagged side of the port
        // changes, or the device rejects the command.
        if !current.tagged_vlans_of(&port).is_empty() {
            let tag = CommandTag::PortConfigure(port.clone());
            plan.pre_commands
                .push(TaggedCommand::new(format!("interface ethe {}", port), tag.clone()));
            plan.pre_commands
                .push(TaggedCommand::new("no dual-mode", tag.clone()));
            plan.pre_commands.push(TaggedCommand::new("exit", tag));
        }
    }

    // Membership removals on modified VLANs, merged with the evictions.
    for change in &diff.vlans_to_modify {
        let removed: BTreeSet<PortId> = change
            .before
            .untagged_ports
            .difference(&change.after.untagged_ports)
            .cloned()
            .collect();
        evictions.entry(change.after.id).or_default().extend(removed);
    }

    for (vid, ports) in &evictions {
        if ports.is_empty() {
            continue;
        }
        let tag = CommandTag::VlanModify(*vid);
        let clauses = brocade_ethe_clauses(ports);
        plan.main_commands
            .push(TaggedCommand::new(format!("vlan {}", vid), tag.clone()));
        plan.main_commands
            .push(TaggedCommand::new(format!("no untagged {}", clauses), tag.clone()));
        plan.main_commands.push(TaggedCommand::new("exit", tag.clone()));
        rollback_blocks.push(vec![
            TaggedCommand::new(format!("vlan {}", vid), tag.clone()),
            TaggedCommand::new(format!("untagged {}", clauses), tag.clone()),
            TaggedCommand::new("exit", tag),
        ]);
    }

    for vlan in &diff.vlans_to_create {
        let tag = CommandTag::VlanCreate(vlan.id);
        let header = match &vlan.name {
            Some(name) => format!("vlan {} name {} by port", vlan.id, name),
            None => format!("vlan {} by port", vlan.id),
        };
        plan.main_commands.push(TaggedCommand::new(header, tag.clone()));
        if !vlan.untagged_ports.is_empty() {
            plan.main_commands.push(TaggedCommand::new(
                format!("untagged {}", brocade_ethe_clauses(&vlan.untagged_ports)),
                tag.clone(),
            ));
        }
        if !vlan.tagged_ports.is_empty() {
            plan.main_commands.push(TaggedCommand::new(
                format!("tagged {}", brocade_ethe_clauses(&vlan.tagged_ports)),
                tag.clone(),
            ));
        }
        if vlan.l3_interface.is_some() {
            plan.main_commands.push(TaggedCommand::new(
                format!("router-interface ve {}", vlan.id),
                tag.clone(),
            ));
        }
        plan.main_commands.push(TaggedCommand::new("exit", tag.clone()));
        if let Some(l3) = &vlan.l3_interface {
            plan.main_commands
                .push(TaggedCommand::new(format!("interface ve {}", vlan.id), tag.clone()));
            plan.main_commands.push(TaggedCommand::new(
                format!("ip address {} {}", l3.address, l3.mask),
                tag.clone(),
            ));
            plan.main_commands.push(TaggedCommand::new("exit", tag.clone()));
        }
        rollback_blocks.push(vec![TaggedCommand::new(format!("no vlan {}", vlan.id), tag)]);
    }

    for change in &diff.vlans_to_modify {
        let tag = CommandTag::VlanModify(change.after.id);
        let added_untagged: BTreeSet<PortId> = change
            .after
            .untagged_ports
            .difference(&change.before.untagged_ports)
            .cloned()
            .collect();
        let added_tagged: BTreeSet<PortId> = change
            .after
            .tagged_ports
            .difference(&change.before.tagged_ports)
            .cloned()
            .collect();
        let removed_tagged: BTreeSet<PortId> = change
            .before
            .tagged_ports
            .difference(&change.after.tagged_ports)
            .cloned()
            .collect();
        let renamed = change.before.name != change.after.name;

        if added_untagged.is_empty() && added_tagged.is_empty() && removed_tagged.is_empty() && !renamed
        {
            continue;
        }

        let header = match (&change.after.name, renamed) {
            (Some(name), true) => format!("vlan {} name {} by port", change.after.id, name),
            _ => format!("vlan {}", change.after.id),
        };
        plan.main_commands.push(TaggedCommand::new(header, tag.clone()));
        let mut undo = vec![TaggedCommand::new(format!("vlan {}", change.after.id), tag.clone())];

        if !removed_tagged.is_empty() {
            let clauses = brocade_ethe_clauses(&removed_tagged);
            plan.main_commands
                .push(TaggedCommand::new(format!("no tagged {}", clauses), tag.clone()));
            undo.push(TaggedCommand::new(format!("tagged {}", clauses), tag.clone()));
        }
        if !added_untagged.is_empty() {
            let clauses = brocade_ethe_clauses(&added_untagged);
            plan.main_commands
                .push(TaggedCommand::new(format!("untagged {}", clauses), tag.clone()));
            undo.push(TaggedCommand::new(format!("no untagged {}", clauses), tag.clone()));
        }
        if !added_tagged.is_empty() {
            let clauses = brocade_ethe_clauses(&added_tagged);
            plan.main_commands
                .push(TaggedCommand::new(format!("tagged {}", clauses), tag.clone()));
            undo.push(TaggedCommand::new(format!("no tagged {}", clauses), tag.clone()));
        }
        plan.main_commands.push(TaggedCommand::new("exit", tag.clone()));
        undo.push(TaggedCommand::new("exit", tag));
        rollback_blocks.push(undo);
    }

    // Deletions: unbind ports first, then remove the VLAN.
    for vlan in &diff.vlans_to_delete {
        let tag = CommandTag::VlanDelete(vlan.id);
        if !vlan.untagged_ports.is_empty() || !vlan.tagged_ports.is_empty() {
            plan.main_commands
                .push(TaggedCommand::new(format!("vlan {}", vlan.id), tag.clone()));
            if !vlan.untagged_ports.is_empty() {
                plan.main_commands.push(TaggedCommand::new(
                    format!("no untagged {}", brocade_ethe_clauses(&vlan.untagged_ports)),
                    tag.clone(),
                ));
            }
            if !vlan.tagged_ports.is_empty() {
                plan.main_commands.push(TaggedCommand::new(
                    format!("no tagged {}", brocade_ethe_clauses(&vlan.tagged_ports)),
                    tag.clone(),
                ));
            }
            plan.main_commands.push(TaggedCommand::new("exit", tag.clone()));
        }
        plan.main_commands
            .push(TaggedCommand::new(format!("no vlan {}", vlan.id), tag.clone()));

        let mut undo = Vec::new();
        let header = match &vlan.name {
            Some(name) => format!("vlan {} name {} by port", vlan.id, name),
            None => format!("vlan {} by port", vlan.id),
        };
        undo.push(TaggedCommand::new(header, tag.clone()));
        if !vlan.untagged_ports.is_empty() {
            undo.push(TaggedCommand::new(
                format!("untagged {}", brocade_ethe_clauses(&vlan.untagged_ports)),
                tag.clone(),
            ));
        }
        if !vlan.tagged_ports.is_empty() {
            undo.push(TaggedCommand::new(
                format!("tagged {}", brocade_ethe_clauses(&vlan.tagged_ports)),
                tag.clone(),
            ));
        }
        undo.push(TaggedCommand::new("exit", tag));
        rollback_blocks.push(undo);
    }

    for change in &diff.ports_to_configure {
        let tag = CommandTag::PortConfigure(change.after.id.clone());
        plan.main_commands.push(TaggedCommand::new(
            format!("interface ethe {}", change.after.id),
            tag.clone(),
        ));
        let mut undo = vec![TaggedCommand::new(
            format!("interface ethe {}", change.after.id),
            tag.clone(),
        )];

        let before = change.before.as_ref();
        if before.map(|p| p.enabled) != Some(change.after.enabled) {
            let (fwd, inv) = if change.after.enabled {
                ("enable", "disable")
            } else {
                ("disable", "enable")
            };
            plan.main_commands.push(TaggedCommand::new(fwd, tag.clone()));
            undo.push(TaggedCommand::new(inv, tag.clone()));
        }
        if let Some(desc) = &change.after.description {
            if before.and_then(|p| p.description.as_deref()) != Some(desc.as_str()) {
                plan.main_commands
                    .push(TaggedCommand::new(format!("port-name {}", desc), tag.clone()));
                match before.and_then(|p| p.description.clone()) {
                    Some(old) => undo.push(TaggedCommand::new(format!("port-name {}", old), tag.clone())),
                    None => undo.push(TaggedCommand::new("no port-name", tag.clone())),
                }
            }
        }
        if let Some(speed) = change.after.speed {
            if before.and_then(|p| p.speed) != Some(speed) {
                plan.main_commands.push(TaggedCommand::new(
                    format!("speed-duplex {}", brocade_speed(speed)),
                    tag.clone(),
                ));
                let old = before.and_then(|p| p.speed).unwrap_or(PortSpeed::Auto);
                undo.push(TaggedCommand::new(
                    format!("speed-duplex {}", brocade_speed(old)),
                    tag.clone(),
                ));
            }
        }
        plan.main_commands.push(TaggedCommand::new("exit", tag.clone()));
        undo.push(TaggedCommand::new("exit", tag));
        rollback_blocks.push(undo);
    }

    for setting in &diff.settings_to_change {
        let tag = CommandTag::Setting(setting.key.clone());
        let fwd = render_global_setting(&setting.key, &setting.after);
        plan.main_commands.push(TaggedCommand::new(fwd, tag.clone()));
        let undo_cmd = match &setting.before {
            Some(before) => render_global_setting(&setting.key, before),
            None => format!("no {}", setting.key),
        };
        rollback_blocks.push(vec![TaggedCommand::new(undo_cmd, tag)]);
    }

    if opts.save_on_success {
        plan.post_commands
            .push(TaggedCommand::new("write memory", CommandTag::Session));
    }

    for block in rollback_blocks.into_iter().rev() {
        plan.rollback_commands.extend(block);
    }
    plan
}

fn render_global_setting(key: &str, value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Bool(true) => key.to_string(),
        serde_json::Value::Bool(false) => format!("no {}", key),
        other => format!("{} {}", key, scalar_text(other)),
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// OpenWrt
// ---------------------------------------------------------------------------

/// Bridge-vlan member notation: untagged ports carry `:u*` (PVID + egress
/// untagged), tagged ports `:t`.
fn openwrt_member(port: &PortId, tagged: bool) -> String {
    if tagged {
        format!("{}:t", port)
    } else {
        format!("{}:u*", port)
    }
}

/// Section index the handler recorded for a VLAN during the last state fetch.
fn openwrt_section_index(current: &DeviceConfig, vlan_id: u16) -> Option<i64> {
    current
        .settings
        .get(&format!("bridge_vlan_index.{}", vlan_id))
        .and_then(|v| v.as_i64())
}

fn openwrt_bridge(current: &DeviceConfig) -> String {
    current
        .settings
        .get("bridge_device")
        .and_then(|v| v.as_str())
        .unwrap_or("br-lan")
        .to_string()
}

fn plan_openwrt(diff: &ConfigDiff, current: &DeviceConfig, opts: PlanOptions) -> CommandPlan {
    let mut plan = CommandPlan::default();
    let mut rollback_blocks: Vec<Vec<TaggedCommand>> = Vec::new();
    let bridge = openwrt_bridge(current);

    // bridge-vlan sections are inert until filtering is on; turn it on with
    // the first VLAN we create rather than on every call.
    let filtering_on = current
        .settings
        .get("vlan_filtering")
        .and_then(|v| v.as_str())
        .map(|v| v == "1")
        .unwrap_or(false);
    if !diff.vlans_to_create.is_empty() && !filtering_on {
        let tag = CommandTag::Setting("vlan_filtering".to_string());
        plan.pre_commands.push(TaggedCommand::new(
            "uci set network.@device[0].vlan_filtering='1'",
            tag.clone(),
        ));
        rollback_blocks.push(vec![TaggedCommand::new(
            "uci set network.@device[0].vlan_filtering='0'".to_string(),
            tag,
        )]);
    }

    for vlan in &diff.vlans_to_create {
        let tag = CommandTag::VlanCreate(vlan.id);
        plan.main_commands
            .push(TaggedCommand::new("uci add network bridge-vlan", tag.clone()));
        plan.main_commands.push(TaggedCommand::new(
            format!("uci set network.@bridge-vlan[-1].device='{}'", bridge),
            tag.clone(),
        ));
        plan.main_commands.push(TaggedCommand::new(
            format!("uci set network.@bridge-vlan[-1].vlan='{}'", vlan.id),
            tag.clone(),
        ));
        for port in &vlan.untagged_ports {
            plan.main_commands.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[-1].ports='{}'",
                    openwrt_member(port, false)
                ),
                tag.clone(),
            ));
        }
        for port in &vlan.tagged_ports {
            plan.main_commands.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[-1].ports='{}'",
                    openwrt_member(port, true)
                ),
                tag.clone(),
            ));
        }
        rollback_blocks.push(vec![TaggedCommand::new(
            "uci delete network.@bridge-vlan[-1]",
            tag,
        )]);
    }

    for change in &diff.vlans_to_modify {
        let tag = CommandTag::VlanModify(change.after.id);
        let Some(idx) = openwrt_section_index(current, change.after.id) else {
            continue;
        };
        plan.main_commands.push(TaggedCommand::new(
            format!("uci delete network.@bridge-vlan[{}].ports", idx),
            tag.clone(),
        ));
        for port in &change.after.untagged_ports {
            plan.main_commands.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[{}].ports='{}'",
                    idx,
                    openwrt_member(port, false)
                ),
                tag.clone(),
            ));
        }
        for port in &change.after.tagged_ports {
            plan.main_commands.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[{}].ports='{}'",
                    idx,
                    openwrt_member(port, true)
                ),
                tag.clone(),
            ));
        }

        let mut undo = vec![TaggedCommand::new(
            format!("uci delete network.@bridge-vlan[{}].ports", idx),
            tag.clone(),
        )];
        for port in &change.before.untagged_ports {
            undo.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[{}].ports='{}'",
                    idx,
                    openwrt_member(port, false)
                ),
                tag.clone(),
            ));
        }
        for port in &change.before.tagged_ports {
            undo.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[{}].ports='{}'",
                    idx,
                    openwrt_member(port, true)
                ),
                tag.clone(),
            ));
        }
        rollback_blocks.push(undo);
    }

    // Delete higher indices first so earlier indices stay valid.
    let mut deletions: Vec<(&Vlan, i64)> = diff
        .vlans_to_delete
        .iter()
        .filter_map(|v| openwrt_section_index(current, v.id).map(|idx| (v, idx)))
        .collect();
    deletions.sort_by_key(|(_, idx)| std::cmp::Reverse(*idx));
    for (vlan, idx) in deletions {
        let tag = CommandTag::VlanDelete(vlan.id);
        plan.main_commands.push(TaggedCommand::new(
            format!("uci delete network.@bridge-vlan[{}]", idx),
            tag.clone(),
        ));
        let mut undo = vec![
            TaggedCommand::new("uci add network bridge-vlan", tag.clone()),
            TaggedCommand::new(
                format!("uci set network.@bridge-vlan[-1].device='{}'", bridge),
                tag.clone(),
            ),
            TaggedCommand::new(
                format!("uci set network.@bridge-vlan[-1].vlan='{}'", vlan.id),
                tag.clone(),
            ),
        ];
        for port in &vlan.untagged_ports {
            undo.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[-1].ports='{}'",
                    openwrt_member(port, false)
                ),
                tag.clone(),
            ));
        }
        for port in &vlan.tagged_ports {
            undo.push(TaggedCommand::new(
                format!(
                    "uci add_list network.@bridge-vlan[-1].ports='{}'",
                    openwrt_member(port, true)
                ),
                tag.clone(),
            ));
        }
        rollback_blocks.push(undo);
    }

    // Port administrative state lives on the port device sections.
    for change in &diff.ports_to_configure {
        let tag = CommandTag::PortConfigure(change.after.id.clone());
        if change.before.as_ref().map(|p| p.enabled) != Some(change.after.enabled) {
            plan.main_commands.push(TaggedCommand::new(
                format!(
                    "ip link set {} {}",
                    change.after.id,
                    if change.after.enabled { "up" } else { "down" }
                ),
                tag.clone(),
            ));
            rollback_blocks.push(vec![TaggedCommand::new(
                format!(
                    "ip link set {} {}",
                    change.after.id,
                    if change.after.enabled { "down" } else { "up" }
                ),
                tag,
            )]);
        }
    }

    for setting in &diff.settings_to_change {
        // Engine-internal keys written by the state fetch never go back out.
        if setting.key.starts_with("bridge_vlan_index.")
            || setting.key == "bridge_device"
            || setting.key == "vlan_filtering"
        {
            continue;
        }
        let tag = CommandTag::Setting(setting.key.clone());
        plan.main_commands.push(TaggedCommand::new(
            format!("uci set network.{}='{}'", setting.key, scalar_text(&setting.after)),
            tag.clone(),
        ));
        let undo = match &setting.before {
            Some(before) => format!("uci set network.{}='{}'", setting.key, scalar_text(before)),
            None => format!("uci delete network.{}", setting.key),
        };
        rollback_blocks.push(vec![TaggedCommand::new(undo, tag)]);
    }

    if !plan.main_commands.is_empty() || !plan.pre_commands.is_empty() {
        if opts.save_on_success {
            plan.post_commands
                .push(TaggedCommand::new("uci commit network", CommandTag::Session));
        }
        plan.post_commands.push(TaggedCommand::new(
            "/etc/init.d/network reload",
            CommandTag::Session,
        ));
    }

    for block in rollback_blocks.into_iter().rev() {
        plan.rollback_commands.extend(block);
    }
    if !plan.rollback_commands.is_empty() {
        plan.rollback_commands
            .push(TaggedCommand::new("uci commit network", CommandTag::Session));
        plan.rollback_commands.push(TaggedCommand::new(
            "/etc/init.d/network reload",
            CommandTag::Session,
        ));
    }
    plan
}

// ---------------------------------------------------------------------------
// Zyxel
// ---------------------------------------------------------------------------

/// Render a port set in Zyxel list notation (`1-4,7,lag1-2`).
pub fn zyxel_port_list(ports: &BTreeSet<PortId>) -> String {
    let mut plain: Vec<u16> = Vec::new();
    let mut lags: Vec<u16> = Vec::new();
    for port in ports {
        match port {
            PortId::Plain(n) => plain.push(*n),
            PortId::Lag(n) => lags.push(*n),
            other => plain.extend(match other {
                PortId::Stacked { port, .. } => Some(*port),
                _ => None,
            }),
        }
    }
    let mut parts = collapse_numeric_ranges(&plain, "");
    parts.extend(collapse_numeric_ranges(&lags, "lag"));
    if parts.is_empty() {
        "---".to_string()
    } else {
        parts.join(",")
    }
}

fn collapse_numeric_ranges(values: &[u16], prefix: &str) -> Vec<String> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut out = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            end = sorted[i + 1];
            i += 1;
        }
        if start == end {
            out.push(format!("{}{}", prefix, start));
        } else {
            out.push(format!("{}{}-{}", prefix, start, end));
        }
        i += 1;
    }
    out
}

/// The Zyxel write surface is the web UI; plan commands are the engine's
/// stable operation syntax which the HTTPS handler translates into
/// dispatcher.cgi form posts.
fn plan_zyxel(diff: &ConfigDiff, _current: &DeviceConfig) -> CommandPlan {
    let mut plan = CommandPlan::default();
    let mut rollback_blocks: Vec<Vec<TaggedCommand>> = Vec::new();

    for vlan in &diff.vlans_to_create {
        let tag = CommandTag::VlanCreate(vlan.id);
        plan.main_commands.push(TaggedCommand::new(
            format!(
                "vlan create {} name {} untagged {} tagged {}",
                vlan.id,
                vlan.name.as_deref().unwrap_or("-"),
                zyxel_port_list(&vlan.untagged_ports),
                zyxel_port_list(&vlan.tagged_ports),
            ),
            tag.clone(),
        ));
        rollback_blocks.push(vec![TaggedCommand::new(format!("vlan delete {}", vlan.id), tag)]);
    }

    for change in &diff.vlans_to_modify {
        let tag = CommandTag::VlanModify(change.after.id);
        plan.main_commands.push(TaggedCommand::new(
            format!(
                "vlan update {} name {} untagged {} tagged {}",
                change.after.id,
                change.after.name.as_deref().unwrap_or("-"),
                zyxel_port_list(&change.after.untagged_ports),
                zyxel_port_list(&change.after.tagged_ports),
            ),
            tag.clone(),
        ));
        rollback_blocks.push(vec![TaggedCommand::new(
            format!(
                "vlan update {} name {} untagged {} tagged {}",
                change.before.id,
                change.before.name.as_deref().unwrap_or("-"),
                zyxel_port_list(&change.before.untagged_ports),
                zyxel_port_list(&change.before.tagged_ports),
            ),
            tag,
        )]);
    }

    for vlan in &diff.vlans_to_delete {
        let tag = CommandTag::VlanDelete(vlan.id);
        plan.main_commands
            .push(TaggedCommand::new(format!("vlan delete {}", vlan.id), tag.clone()));
        rollback_blocks.push(vec![TaggedCommand::new(
            format!(
                "vlan create {} name {} untagged {} tagged {}",
                vlan.id,
                vlan.name.as_deref().unwrap_or("-"),
                zyxel_port_list(&vlan.untagged_ports),
                zyxel_port_list(&vlan.tagged_ports),
            ),
            tag,
        )]);
    }

    for change in &diff.ports_to_configure {
        let tag = CommandTag::PortConfigure(change.after.id.clone());
        plan.main_commands.push(TaggedCommand::new(
            format!(
                "port update {} state {} speed {} name {}",
                change.after.id,
                if change.after.enabled { "enable" } else { "disable" },
                change.after.speed.map(|s| s.to_string()).unwrap_or_else(|| "auto".into()),
                change.after.description.as_deref().unwrap_or("-"),
            ),
            tag.clone(),
        ));
        if let Some(before) = &change.before {
            rollback_blocks.push(vec![TaggedCommand::new(
                format!(
                    "port update {} state {} speed {} name {}",
                    before.id,
                    if before.enabled { "enable" } else { "disable" },
                    before.speed.map(|s| s.to_string()).unwrap_or_else(|| "auto".into()),
                    before.description.as_deref().unwrap_or("-"),
                ),
                tag,
            )]);
        }
    }

    for block in rollback_blocks.into_iter().rev() {
        plan.rollback_commands.extend(block);
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredState;
    use crate::diff::diff_states;

    fn brocade_device() -> DeviceConfig {
        let mut config = DeviceConfig::new("core-sw1");
        let mut v1 = Vlan::new(1);
        for p in 1..=24u16 {
            v1.untagged_ports.insert(PortId::stacked(1, 1, p));
        }
        config.insert_vlan(v1);
        config.insert_vlan(Vlan::new(254));
        config
    }

    #[test]
    fn ethe_clauses_collapse_ranges_per_module() {
        let ports: BTreeSet<PortId> = ["1/1/5", "1/1/6", "1/1/7", "1/1/8", "1/2/1"]
            .iter()
            .map(|p| p.parse().unwrap())
            .collect();
        assert_eq!(
            brocade_ethe_clauses(&ports),
            "ethe 1/1/5 to 1/1/8 ethe 1/2/1"
        );
    }

    #[test]
    fn ethe_clause_single_port_has_no_range() {
        let ports: BTreeSet<PortId> = ["1/2/1".parse().unwrap()].into_iter().collect();
        assert_eq!(brocade_ethe_clauses(&ports), "ethe 1/2/1");
    }

    // Scenario: adding VLAN 100 (Servers) to a device whose ports 1/1/5-8 sit
    // untagged in VLAN 1 must first evict them from VLAN 1, then create the
    // VLAN, then persist.
    #[test]
    fn brocade_create_vlan_canonical_plan() {
        let current = brocade_device();
        let desired = DesiredState::from_json(
            r#"{
                "device_id": "core-sw1",
                "mode": "patch",
                "vlans": {
                    "100": {
                        "name": "Servers",
                        "untagged_ports": ["1/1/5", "1/1/6", "1/1/7", "1/1/8"],
                        "tagged_ports": ["1/2/1"]
                    }
                }
            }"#,
        )
        .unwrap();

        let diff = diff_states(&current, &desired);
        let plan = build_plan(
            TransportKind::BrocadeTelnet,
            &diff,
            &current,
            PlanOptions::default(),
        )
        .unwrap();

        assert_eq!(
            plan.render(),
            vec![
                "configure terminal",
                "vlan 1",
                "no untagged ethe 1/1/5 to 1/1/8",
                "exit",
                "vlan 100 name Servers by port",
                "untagged ethe 1/1/5 to 1/1/8",
                "tagged ethe 1/2/1",
                "exit",
                "write memory",
            ]
        );
    }

    #[test]
    fn brocade_rollback_inverts_in_reverse_order() {
        let current = brocade_device();
        let desired = DesiredState::from_json(
            r#"{
                "device_id": "core-sw1",
                "vlans": {
                    "100": {
                        "name": "Servers",
                        "untagged_ports": ["1/1/5", "1/1/6", "1/1/7", "1/1/8"],
                        "tagged_ports": ["1/2/1"]
                    }
                }
            }"#,
        )
        .unwrap();
        let diff = diff_states(&current, &desired);
        let plan = build_plan(
            TransportKind::BrocadeTelnet,
            &diff,
            &current,
            PlanOptions::default(),
        )
        .unwrap();

        let rollback: Vec<String> = plan
            .rollback_commands
            .iter()
            .map(|c| c.command.clone())
            .collect();
        // Create inverts first (reverse order), then the eviction restores.
        assert_eq!(
            rollback,
            vec![
                "no vlan 100",
                "vlan 1",
                "untagged ethe 1/1/5 to 1/1/8",
                "exit",
            ]
        );
    }

    #[test]
    fn brocade_dual_mode_pre_commands_for_tagged_ports() {
        let mut current = brocade_device();
        let mut v50 = Vlan::new(50);
        v50.tagged_ports.insert(PortId::stacked(1, 1, 10));
        current.insert_vlan(v50);

        let desired = DesiredState::from_json(
            r#"{
                "device_id": "core-sw1",
                "vlans": {"100": {"untagged_ports": ["1/1/10"]}}
            }"#,
        )
        .unwrap();
        let diff = diff_states(&current, &desired);
        let plan = build_plan(
            TransportKind::BrocadeTelnet,
            &diff,
            &current,
            PlanOptions::default(),
        )
        .unwrap();

        let pre: Vec<String> = plan.pre_commands.iter().map(|c| c.command.clone()).collect();
        assert_eq!(
            pre,
            vec![
                "configure terminal",
                "interface ethe 1/1/10",
                "no dual-mode",
                "exit",
            ]
        );
    }

    #[test]
    fn brocade_delete_unbinds_before_removal() {
        let mut current = brocade_device();
        let mut v200 = Vlan::new(200);
        v200.untagged_ports.insert(PortId::stacked(1, 1, 30));
        current.insert_vlan(v200);

        let desired = DesiredState::from_json(
            r#"{"device_id": "core-sw1", "vlans": {"200": {"action": "absent"}}}"#,
        )
        .unwrap();
        let diff = diff_states(&current, &desired);
        let plan = build_plan(
            TransportKind::BrocadeTelnet,
            &diff,
            &current,
            PlanOptions::default(),
        )
        .unwrap();
        let main: Vec<String> = plan.main_commands.iter().map(|c| c.command.clone()).collect();
        assert_eq!(
            main,
            vec![
                "vlan 200",
                "no untagged ethe 1/1/30",
                "exit",
                "no vlan 200",
            ]
        );
    }

    #[test]
    fn openwrt_first_vlan_enables_filtering() {
        let mut current = DeviceConfig::new("gw1");
        current.settings.insert(
            "bridge_device".into(),
            serde_json::Value::String("br-lan".into()),
        );
        current
            .settings
            .insert("vlan_filtering".into(), serde_json::Value::String("0".into()));

        let desired = DesiredState::from_json(
            r#"{"device_id": "gw1", "vlans": {"100": {"untagged_ports": ["lan1"], "tagged_ports": ["lan4"]}}}"#,
        )
        .unwrap();
        let diff = diff_states(&current, &desired);
        let plan = build_plan(
            TransportKind::OpenWrtSsh,
            &diff,
            &current,
            PlanOptions::default(),
        )
        .unwrap();

        assert_eq!(
            plan.pre_commands[0].command,
            "uci set network.@device[0].vlan_filtering='1'"
        );
        let rendered = plan.render();
        assert!(rendered.contains(&"uci add network bridge-vlan".to_string()));
        assert!(rendered.contains(&"uci add_list network.@bridge-vlan[-1].ports='lan1:u*'".to_string()));
        assert!(rendered.contains(&"uci add_list network.@bridge-vlan[-1].ports='lan4:t'".to_string()));
        assert_eq!(
            rendered.last().unwrap(),
            "/etc/init.d/network reload"
        );
    }

    #[test]
    fn openwrt_second_vlan_does_not_touch_filtering() {
        let mut current = DeviceConfig::new("gw1");
        current
            .settings
            .insert("vlan_filtering".into(), serde_json::Value::String("1".into()));
        let desired = DesiredState::from_json(
            r#"{"device_id": "gw1", "vlans": {"200": {"untagged_ports": ["lan2"]}}}"#,
        )
        .unwrap();
        let diff = diff_states(&current, &desired);
        let plan = build_plan(
            TransportKind::OpenWrtSsh,
            &diff,
            &current,
            PlanOptions::default(),
        )
        .unwrap();
        assert!(plan.pre_commands.is_empty());
    }

    #[test]
    fn zyxel_port_list_notation() {
        let ports: BTreeSet<PortId> = ["1", "2", "3", "4", "7", "10", "11", "12", "lag1", "lag2"]
            .iter()
            .map(|p| p.parse().unwrap())
            .collect();
        assert_eq!(zyxel_port_list(&ports), "1-4,7,10-12,lag1-2");
        assert_eq!(zyxel_port_list(&BTreeSet::new()), "---");
    }

    #[test]
    fn empty_diff_produces_effectively_empty_plan() {
        let current = brocade_device();
        let diff = ConfigDiff::default();
        let plan = build_plan(
            TransportKind::BrocadeTelnet,
            &diff,
            &current,
            PlanOptions::default(),
        )
        .unwrap();
        assert!(plan.main_commands.is_empty());
    }
}
